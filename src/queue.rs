use crate::cancel::{CancelNode, Wake};
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

/// Why a non-blocking send handed the item back
pub enum TrySendError<T> {
    /// No free slot
    Full(T),
    /// The queue was closed by its owner
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    /// Whether the send failed only for lack of space
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("sending on a full queue"),
            Self::Closed(_) => f.write_str("sending on a closed queue"),
        }
    }
}

impl<T> From<TrySendError<T>> for PipelineError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => PipelineError::QueueFull,
            TrySendError::Closed(_) => PipelineError::QueueClosed,
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T: Send> Wake for Shared<T> {
    fn wake(&self) {
        // Taking the lock orders this wakeup after any waiter's last check.
        let _state = self.state.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Fixed-capacity FIFO shared between producers and consumers.
///
/// Blocking operations park on a condition variable and wake on space/items,
/// on close, or when the caller's [`CancelNode`] is cancelled or times out.
/// Once closed, no send succeeds but buffered items stay receivable; after the
/// last one `receive` yields `Ok(None)`.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    fn waker(&self) -> Weak<dyn Wake> {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        weak
    }

    /// Push an item, blocking while the queue is full.
    ///
    /// Fails with `QueueClosed` if the queue is (or becomes) closed, and with
    /// `Cancelled`/`DeadlineExceeded` if `node` finishes first.
    pub fn send(&self, item: T, node: &CancelNode) -> Result<()> {
        let mut state = self.shared.state.lock();
        let mut registration = None;
        loop {
            if state.closed {
                return Err(PipelineError::QueueClosed);
            }
            if let Some(reason) = node.reason() {
                if state.items.len() < self.shared.capacity {
                    // Hand a wakeup we may have absorbed to the next sender.
                    self.shared.not_full.notify_one();
                }
                return Err(reason.into());
            }
            if state.items.len() < self.shared.capacity {
                state.items.push_back(item);
                drop(state);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            if registration.is_none() {
                registration = node.register(self.waker());
                if registration.is_none() {
                    continue;
                }
            }
            node.park(&self.shared.not_full, &mut state);
        }
    }

    /// Push without blocking
    pub fn try_send(&self, item: T) -> std::result::Result<(), TrySendError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(item));
        }
        if state.items.len() >= self.shared.capacity {
            return Err(TrySendError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest item, blocking while the queue is empty and open.
    ///
    /// `Ok(None)` means closed and drained. Cancellation of `node` wins over
    /// buffered items so that cancelled consumers stop promptly.
    pub fn receive(&self, node: &CancelNode) -> Result<Option<T>> {
        let mut state = self.shared.state.lock();
        let mut registration = None;
        loop {
            if let Some(reason) = node.reason() {
                if !state.items.is_empty() {
                    self.shared.not_empty.notify_one();
                }
                return Err(reason.into());
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            if registration.is_none() {
                registration = node.register(self.waker());
                if registration.is_none() {
                    continue;
                }
            }
            node.park(&self.shared.not_empty, &mut state);
        }
    }

    /// Pop without blocking
    pub fn try_receive(&self) -> Option<T> {
        let item = self.shared.state.lock().items.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Iterate until the queue is closed and drained or `node` finishes.
    ///
    /// Both endings look the same to the caller; check `node` afterwards, or
    /// use [`try_iter`](Self::try_iter) to see the cancellation as an error.
    pub fn iter<'a>(&'a self, node: &'a CancelNode) -> ReceiveIter<'a, T> {
        ReceiveIter { queue: self, node }
    }

    /// Like [`iter`](Self::iter), but a finished `node` is yielded once as
    /// `Err(Cancelled | DeadlineExceeded)` before iteration ends
    pub fn try_iter<'a>(&'a self, node: &'a CancelNode) -> TryReceiveIter<'a, T> {
        TryReceiveIter {
            queue: self,
            node,
            done: false,
        }
    }

    /// Close the sending side. Buffered items remain receivable.
    ///
    /// Closing twice is a caller bug and reported as `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PipelineError::QueueClosed);
        }
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        Ok(())
    }

    /// Remove and return everything currently buffered
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.shared.state.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.shared.not_full.notify_all();
        }
        items
    }

    /// Get the current number of buffered items
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the capacity of the queue
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether the owner has closed the queue
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Buffer utilization as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity()).min(100) as u32
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Blocking iterator over a queue, see [`BoundedQueue::iter`]
pub struct ReceiveIter<'a, T> {
    queue: &'a BoundedQueue<T>,
    node: &'a CancelNode,
}

impl<T: Send + 'static> Iterator for ReceiveIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.receive(self.node).ok().flatten()
    }
}

/// Fallible blocking iterator over a queue, see [`BoundedQueue::try_iter`]
pub struct TryReceiveIter<'a, T> {
    queue: &'a BoundedQueue<T>,
    node: &'a CancelNode,
    done: bool,
}

impl<T: Send + 'static> Iterator for TryReceiveIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match self.queue.receive(self.node) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        let node = CancelNode::new();
        for i in 0..4 {
            queue.send(i, &node).unwrap();
        }
        queue.close().unwrap();
        let received: Vec<i32> = queue.iter(&node).collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_close_drains_buffered_items_first() {
        let queue = BoundedQueue::new(3);
        let node = CancelNode::new();
        for i in 0..3 {
            queue.send(i, &node).unwrap();
        }
        queue.close().unwrap();

        for i in 0..3 {
            assert_eq!(queue.receive(&node), Ok(Some(i)));
        }
        assert_eq!(queue.receive(&node), Ok(None));
        assert_eq!(queue.receive(&node), Ok(None));
    }

    #[test]
    fn test_send_after_close_fails() {
        let queue = BoundedQueue::new(2);
        let node = CancelNode::new();
        queue.close().unwrap();
        assert_eq!(queue.send(1, &node), Err(PipelineError::QueueClosed));
        assert!(matches!(queue.try_send(1), Err(TrySendError::Closed(1))));
    }

    #[test]
    fn test_double_close_is_reported() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(queue.close().is_ok());
        assert_eq!(queue.close(), Err(PipelineError::QueueClosed));
    }

    #[test]
    fn test_try_send_full() {
        let queue = BoundedQueue::new(1);
        assert!(queue.try_send(1).is_ok());
        let err = queue.try_send(2).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
        assert_eq!(queue.utilization(), 100);
    }

    #[test]
    fn test_blocked_send_resumes_after_receive() {
        let queue = BoundedQueue::new(1);
        let node = CancelNode::new();
        queue.send(1, &node).unwrap();

        let producer = {
            let queue = queue.clone();
            let node = node.clone();
            thread::spawn(move || queue.send(2, &node))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.receive(&node), Ok(Some(1)));
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(queue.receive(&node), Ok(Some(2)));
    }

    #[test]
    fn test_blocked_send_unblocks_on_close() {
        let queue = BoundedQueue::new(1);
        let node = CancelNode::new();
        queue.send(1, &node).unwrap();

        let producer = {
            let queue = queue.clone();
            let node = node.clone();
            thread::spawn(move || queue.send(2, &node))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close().unwrap();
        assert_eq!(producer.join().unwrap(), Err(PipelineError::QueueClosed));
    }

    #[test]
    fn test_blocked_receive_unblocks_on_cancel() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        let root = CancelNode::new();
        let node = root.child();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.receive(&node))
        };
        thread::sleep(Duration::from_millis(20));
        root.cancel();
        assert_eq!(consumer.join().unwrap(), Err(PipelineError::Cancelled));
    }

    #[test]
    fn test_receive_honours_deadline() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        let node = CancelNode::with_timeout(Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(queue.receive(&node), Err(PipelineError::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_try_iter_surfaces_cancellation() {
        let queue = BoundedQueue::new(2);
        let node = CancelNode::new();
        queue.send(7, &node).unwrap();
        node.cancel();

        // Cancellation wins over buffered items, and is reported once.
        let items: Vec<Result<i32>> = queue.try_iter(&node).collect();
        assert_eq!(items, vec![Err(PipelineError::Cancelled)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_try_iter_ends_cleanly_on_close() {
        let queue = BoundedQueue::new(2);
        let node = CancelNode::with_timeout(Duration::from_secs(5));
        queue.send(1, &node).unwrap();
        queue.send(2, &node).unwrap();
        queue.close().unwrap();
        let items: Vec<Result<i32>> = queue.try_iter(&node).collect();
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }

    #[test]
    fn test_drain() {
        let queue = BoundedQueue::new(4);
        for i in 0..3 {
            queue.try_send(i).unwrap();
        }
        assert_eq!(queue.drain(), vec![0, 1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_receive(), None);
    }
}
