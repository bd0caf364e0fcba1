//! Tree of cancellation signals with optional deadlines.
//!
//! Every blocking operation in the engine takes a [`CancelNode`]. Cancelling a
//! node cancels its whole subtree, and a child's effective deadline is the
//! earlier of its own and its parent's, so a timeout set high in the tree bounds
//! everything below it.
//!
//! Parents hold only weak references to children and children only a weak
//! reference to their parent: a node lives exactly as long as the work holding
//! a handle to it.

use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Why a node stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Explicitly cancelled, on this node or an ancestor
    Cancelled,
    /// The node's effective deadline elapsed
    DeadlineExceeded,
}

impl From<CancelReason> for PipelineError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => PipelineError::Cancelled,
            CancelReason::DeadlineExceeded => PipelineError::DeadlineExceeded,
        }
    }
}

/// Something parked on a foreign condition variable that must be woken when a
/// node is cancelled.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

struct NodeState {
    reason: Option<CancelReason>,
    children: Vec<Weak<Inner>>,
    wakers: Vec<(u64, Weak<dyn Wake>)>,
    next_waker_id: u64,
}

struct Inner {
    state: Mutex<NodeState>,
    cond: Condvar,
    /// Effective deadline, already folded with every ancestor's
    deadline: Option<Instant>,
    parent: Weak<Inner>,
}

impl Inner {
    fn new(reason: Option<CancelReason>, deadline: Option<Instant>, parent: Weak<Inner>) -> Self {
        Self {
            state: Mutex::new(NodeState {
                reason,
                children: Vec::new(),
                wakers: Vec::new(),
                next_waker_id: 0,
            }),
            cond: Condvar::new(),
            deadline,
            parent,
        }
    }

    fn reason_locked(&self, state: &NodeState) -> Option<CancelReason> {
        state.reason.or_else(|| match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        })
    }

    fn cancel(&self, reason: CancelReason) {
        let (children, wakers) = {
            let mut state = self.state.lock();
            if self.reason_locked(&state).is_some() {
                return;
            }
            state.reason = Some(reason);
            let children: Vec<Arc<Inner>> = state
                .children
                .drain(..)
                .filter_map(|child| child.upgrade())
                .collect();
            let wakers: Vec<Arc<dyn Wake>> = state
                .wakers
                .drain(..)
                .filter_map(|(_, waker)| waker.upgrade())
                .collect();
            (children, wakers)
        };

        // Node lock is released before touching any waiter's lock.
        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for child in children {
            child.cancel(reason);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.upgrade() {
            parent
                .state
                .lock()
                .children
                .retain(|child| child.strong_count() > 0);
        }
    }
}

/// A handle to one node of the cancellation tree. Cloning shares the node.
#[derive(Clone)]
pub struct CancelNode {
    inner: Arc<Inner>,
}

impl CancelNode {
    /// Create a root node with no deadline. A root lives until it is
    /// cancelled explicitly or every handle is dropped.
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// Create a root node that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now().checked_add(timeout))
    }

    /// Create a root node with an optional absolute deadline
    pub fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner::new(None, deadline, Weak::new())),
        }
    }

    /// Derive a child that inherits this node's deadline
    pub fn child(&self) -> CancelNode {
        self.child_with_deadline(None)
    }

    /// Derive a child that expires after `timeout` or at this node's deadline,
    /// whichever comes first
    pub fn child_with_timeout(&self, timeout: Duration) -> CancelNode {
        self.child_with_deadline(Instant::now().checked_add(timeout))
    }

    /// Derive a child with an optional deadline of its own.
    ///
    /// A child of an already cancelled node is born cancelled with the same reason.
    pub fn child_with_deadline(&self, deadline: Option<Instant>) -> CancelNode {
        let effective = match (self.inner.deadline, deadline) {
            (Some(inherited), Some(own)) => Some(inherited.min(own)),
            (inherited, own) => inherited.or(own),
        };

        let mut state = self.inner.state.lock();
        let inherited_reason = self.inner.reason_locked(&state);
        let child = Arc::new(Inner::new(
            inherited_reason,
            effective,
            Arc::downgrade(&self.inner),
        ));
        if inherited_reason.is_none() {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
        }
        drop(state);

        CancelNode { inner: child }
    }

    /// Cancel this node and every live descendant. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Cancelled);
    }

    /// Cancel with an explicit reason. A node that is already done keeps its
    /// first reason.
    pub fn cancel_with(&self, reason: CancelReason) {
        self.inner.cancel(reason);
    }

    /// Whether the node is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason this node is done, if it is
    pub fn reason(&self) -> Option<CancelReason> {
        let state = self.inner.state.lock();
        self.inner.reason_locked(&state)
    }

    /// `Ok(())` while the node is live, the matching error once it is done
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Effective deadline of this node
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the effective deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Block until the node is cancelled or its deadline elapses.
    ///
    /// Never returns on a live root without a deadline until someone cancels it.
    pub fn wait(&self) -> CancelReason {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(reason) = self.inner.reason_locked(&state) {
                return reason;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    self.inner.cond.wait_until(&mut state, deadline);
                }
                None => self.inner.cond.wait(&mut state),
            }
        }
    }

    /// Block for at most `timeout`. Returns the reason if the node finished
    /// first, `None` if the timeout ran out on a live node.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelReason> {
        let until = Instant::now().checked_add(timeout);
        let wake_at = match (self.inner.deadline, until) {
            (Some(deadline), Some(until)) => Some(deadline.min(until)),
            (deadline, until) => deadline.or(until),
        };

        let mut state = self.inner.state.lock();
        loop {
            if let Some(reason) = self.inner.reason_locked(&state) {
                return Some(reason);
            }
            if matches!(until, Some(until) if Instant::now() >= until) {
                return None;
            }
            match wake_at {
                Some(at) => {
                    self.inner.cond.wait_until(&mut state, at);
                }
                None => self.inner.cond.wait(&mut state),
            }
        }
    }

    /// Register a waker fired on cancellation. Returns `None` when the node is
    /// already done, in which case the caller must not park.
    pub(crate) fn register(&self, waker: Weak<dyn Wake>) -> Option<WakerGuard> {
        let mut state = self.inner.state.lock();
        if self.inner.reason_locked(&state).is_some() {
            return None;
        }
        let id = state.next_waker_id;
        state.next_waker_id += 1;
        state.wakers.push((id, waker));
        Some(WakerGuard {
            node: Arc::clone(&self.inner),
            id,
        })
    }

    /// Park on a foreign condition variable until notified or this node's
    /// deadline, whichever comes first.
    pub(crate) fn park<T>(&self, cond: &Condvar, guard: &mut MutexGuard<'_, T>) {
        match self.inner.deadline {
            Some(deadline) => {
                cond.wait_until(guard, deadline);
            }
            None => cond.wait(guard),
        }
    }

    #[cfg(test)]
    fn live_children(&self) -> usize {
        self.inner
            .state
            .lock()
            .children
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }
}

impl Default for CancelNode {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelNode")
            .field("reason", &self.reason())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Deregisters a waker when the waiting operation returns
pub(crate) struct WakerGuard {
    node: Arc<Inner>,
    id: u64,
}

impl Drop for WakerGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.node.state.lock().wakers.retain(|(waker_id, _)| *waker_id != id);
    }
}
