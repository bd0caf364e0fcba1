//! Fan-out and fan-in over bounded queues.
//!
//! Fan-out runs `k` instances of a stage against one shared input, each with
//! its own output. Fan-in merges several queues into one and closes the merged
//! output only after every input has been closed and drained.

use crate::cancel::CancelNode;
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::queue::BoundedQueue;
use crate::shutdown::TaskGroup;
use crate::stage::{spawn_stage, Stage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Start `instances` copies of a stage reading `input`.
///
/// `factory` is called with the instance index. Every output has the input's
/// capacity and is closed by its own instance. The instances run under a
/// child of `node`; if one fails to spawn, the ones already running are
/// cancelled before the error is returned.
pub fn fan_out<In, Out, S, F>(
    tasks: &mut TaskGroup,
    name: &str,
    input: &BoundedQueue<In>,
    instances: usize,
    node: &CancelNode,
    metrics: &StageMetrics,
    mut factory: F,
) -> Result<Vec<BoundedQueue<Out>>>
where
    In: Send + 'static,
    Out: Send + 'static,
    S: Stage<In, Out>,
    F: FnMut(usize) -> S,
{
    if instances == 0 {
        return Err(PipelineError::ConfigError(format!(
            "stage {} needs at least one instance",
            name
        )));
    }

    let group = node.child();
    let mut outputs = Vec::with_capacity(instances);
    for index in 0..instances {
        let output = BoundedQueue::new(input.capacity());
        if let Err(err) = spawn_stage(
            tasks,
            &format!("{}-{}", name, index),
            input.clone(),
            output.clone(),
            &group,
            metrics.clone(),
            factory(index),
        ) {
            debug!(stage = %name, started = index, %err, "fan-out aborted, cancelling started instances");
            group.cancel();
            return Err(err);
        }
        outputs.push(output);
    }
    Ok(outputs)
}

/// Forwards one input into the shared output; the last one out closes it
struct Forwarder<T: Send + 'static> {
    index: usize,
    input: BoundedQueue<T>,
    output: BoundedQueue<T>,
    node: CancelNode,
    metrics: StageMetrics,
    remaining: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Forwarder<T> {
    fn run(self) {
        loop {
            match self.input.receive(&self.node) {
                Ok(Some(item)) => {
                    if let Err(err) = self.output.send(item, &self.node) {
                        self.metrics.record_dropped(1);
                        debug!(input = self.index, %err, "fan-in forwarder stopped while sending");
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    debug!(input = self.index, %err, "fan-in forwarder cancelled");
                    return;
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for Forwarder<T> {
    fn drop(&mut self) {
        release(&self.remaining, 1, &self.output);
    }
}

/// Drop `count` forwarders from the completion counter, closing the output
/// when none remain.
fn release<T: Send + 'static>(remaining: &AtomicUsize, count: usize, output: &BoundedQueue<T>) {
    if remaining.fetch_sub(count, Ordering::AcqRel) == count {
        if let Err(err) = output.close() {
            debug!(%err, "fan-in output already closed");
        }
    }
}

/// Merge `inputs` into a single queue of `capacity`.
///
/// The merged output closes once every input has reported closed-and-drained
/// (or, under cancellation, once every forwarder has stopped). With no inputs
/// the output is returned already closed.
pub fn fan_in<T: Send + 'static>(
    tasks: &mut TaskGroup,
    name: &str,
    inputs: Vec<BoundedQueue<T>>,
    capacity: usize,
    node: &CancelNode,
) -> Result<BoundedQueue<T>> {
    merge(tasks, name, inputs, capacity, node, &StageMetrics::new())
}

/// [`fan_in`] that counts items a cancelled forwarder could not deliver as
/// dropped in `metrics`
pub(crate) fn merge<T: Send + 'static>(
    tasks: &mut TaskGroup,
    name: &str,
    inputs: Vec<BoundedQueue<T>>,
    capacity: usize,
    node: &CancelNode,
    metrics: &StageMetrics,
) -> Result<BoundedQueue<T>> {
    if capacity == 0 {
        return Err(PipelineError::ConfigError(format!(
            "fan-in {} needs a non-zero capacity",
            name
        )));
    }
    let output = BoundedQueue::new(capacity);
    if inputs.is_empty() {
        output.close()?;
        return Ok(output);
    }

    let total = inputs.len();
    let remaining = Arc::new(AtomicUsize::new(total));
    for (index, input) in inputs.into_iter().enumerate() {
        let forwarder = Forwarder {
            index,
            input,
            output: output.clone(),
            node: node.clone(),
            metrics: metrics.clone(),
            remaining: Arc::clone(&remaining),
        };
        // A forwarder that fails to spawn is dropped and releases itself; the
        // ones never created are released here.
        if let Err(err) = tasks.spawn(format!("{}-fan-in-{}", name, index), move || forwarder.run()) {
            let never_started = total - index - 1;
            if never_started > 0 {
                release(&remaining, never_started, &output);
            }
            return Err(err);
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::MapStage;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fan_in_with_no_inputs_is_closed() {
        let mut tasks = TaskGroup::new("test");
        let node = CancelNode::new();
        let output: BoundedQueue<u8> = fan_in(&mut tasks, "empty", vec![], 4, &node).unwrap();
        assert_eq!(output.receive(&node), Ok(None));
    }

    #[test]
    fn test_fan_in_waits_for_every_input() {
        let mut tasks = TaskGroup::new("test");
        let node = CancelNode::new();
        let a = BoundedQueue::new(4);
        let b = BoundedQueue::new(4);
        let merged = fan_in(&mut tasks, "merge", vec![a.clone(), b.clone()], 4, &node).unwrap();

        a.send(1, &node).unwrap();
        a.close().unwrap();
        assert_eq!(merged.receive(&node), Ok(Some(1)));

        // `a` is finished but `b` is still open: the output must stay open.
        thread::sleep(Duration::from_millis(20));
        assert!(!merged.is_closed());

        b.send(2, &node).unwrap();
        b.close().unwrap();
        assert_eq!(merged.receive(&node), Ok(Some(2)));
        assert_eq!(merged.receive(&node), Ok(None));
        assert!(tasks.wait_until(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_fan_out_shares_input_across_instances() {
        let mut tasks = TaskGroup::new("test");
        let node = CancelNode::new();
        let metrics = StageMetrics::new();
        let input = BoundedQueue::new(16);

        let outputs = fan_out(&mut tasks, "double", &input, 3, &node, &metrics, |_| {
            MapStage::new("double", |n: u32| -> Result<u32> { Ok(n * 2) })
        })
        .unwrap();
        assert_eq!(outputs.len(), 3);

        for n in 0..10u32 {
            input.send(n, &node).unwrap();
        }
        input.close().unwrap();

        let merged = fan_in(&mut tasks, "double", outputs, 16, &node).unwrap();
        let mut results: Vec<u32> = merged.iter(&node).collect();
        results.sort_unstable();
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(metrics.total_received(), 10);
    }

    #[test]
    fn test_failed_spawn_cancels_started_instances() {
        let mut tasks = TaskGroup::new("test");
        tasks.limit_spawns(2);
        let node = CancelNode::new();
        let input: BoundedQueue<u32> = BoundedQueue::new(4);

        let result = fan_out(&mut tasks, "partial", &input, 3, &node, &StageMetrics::new(), |_| {
            MapStage::new("id", |n: u32| -> Result<u32> { Ok(n) })
        });
        assert!(matches!(result, Err(PipelineError::ThreadError(_))));
        assert_eq!(tasks.len(), 2);

        // The two running instances were parked on the open input; they must
        // have been released without anyone closing it or cancelling `node`.
        assert!(tasks.wait_until(Instant::now() + Duration::from_secs(2)));
        assert!(!node.is_done());
        assert!(!input.is_closed());
    }

    #[test]
    fn test_cancelled_forwarder_counts_dropped_item() {
        let mut tasks = TaskGroup::new("test");
        let node = CancelNode::new();
        let metrics = StageMetrics::new();
        let source = BoundedQueue::new(4);
        let merged = merge(&mut tasks, "merge", vec![source.clone()], 1, &node, &metrics).unwrap();

        // One fills the output, the forwarder blocks holding the second.
        source.send(1u8, &node).unwrap();
        source.send(2u8, &node).unwrap();
        while !source.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        node.cancel();
        assert!(tasks.wait_until(Instant::now() + Duration::from_secs(2)));

        assert_eq!(merged.len(), 1);
        assert_eq!(metrics.total_dropped(), 1);
        assert!(merged.is_closed());
    }

    #[test]
    fn test_fan_out_rejects_zero_instances() {
        let mut tasks = TaskGroup::new("test");
        let node = CancelNode::new();
        let input: BoundedQueue<u32> = BoundedQueue::new(1);
        let result = fan_out(&mut tasks, "none", &input, 0, &node, &StageMetrics::new(), |_| {
            MapStage::new("id", |n: u32| -> Result<u32> { Ok(n) })
        });
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
