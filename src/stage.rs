use crate::cancel::CancelNode;
use crate::error::{panic_message, PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::queue::BoundedQueue;
use crate::shutdown::TaskGroup;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, warn};

/// A transformation step in a pipeline
pub trait Stage<In, Out>: Send + 'static {
    /// Process one input item. Can produce 0, 1, or multiple outputs.
    fn process(&mut self, input: In) -> Result<Vec<Out>>;

    /// Called before the stage starts processing
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once the input is exhausted or the stage is cancelled
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// Drives one stage instance: receive from `input`, process, send to `output`.
///
/// When the input is closed and drained, or the node is cancelled, the runner
/// closes its output and returns. Failed or panicking items are counted and
/// dropped; the runner keeps going. Outputs it could not send before being
/// cancelled are counted as dropped.
pub struct StageRunner<In, Out> {
    name: String,
    input: BoundedQueue<In>,
    output: BoundedQueue<Out>,
    node: CancelNode,
    metrics: StageMetrics,
}

impl<In: Send + 'static, Out: Send + 'static> StageRunner<In, Out> {
    pub fn new(
        name: impl Into<String>,
        input: BoundedQueue<In>,
        output: BoundedQueue<Out>,
        node: CancelNode,
        metrics: StageMetrics,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            node,
            metrics,
        }
    }

    /// Get a reference to the metrics
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Run the stage until its input is exhausted or it is cancelled
    pub fn run<S: Stage<In, Out>>(self, mut stage: S) {
        debug!(stage = %self.name, kind = stage.name(), "stage started");

        if let Err(err) = stage.on_start() {
            warn!(stage = %self.name, %err, "stage failed to start");
        } else {
            self.process_all(&mut stage);
            if let Err(err) = stage.on_shutdown() {
                warn!(stage = %self.name, %err, "stage shutdown hook failed");
            }
        }

        if let Err(err) = self.output.close() {
            debug!(stage = %self.name, %err, "stage output already closed");
        }
        debug!(stage = %self.name, "stage stopped");
    }

    fn process_all<S: Stage<In, Out>>(&self, stage: &mut S) {
        'items: loop {
            let item = match self.input.receive(&self.node) {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    debug!(stage = %self.name, %err, "stage cancelled while receiving");
                    break;
                }
            };
            self.metrics.record_received();

            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.process(item)))
                .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(&*payload))));
            self.metrics.record_latency(start.elapsed());

            match outcome {
                Ok(outputs) => {
                    let mut pending = outputs.into_iter();
                    while let Some(output) = pending.next() {
                        if let Err(err) = self.output.send(output, &self.node) {
                            let dropped = 1 + pending.len() as u64;
                            self.metrics.record_dropped(dropped);
                            debug!(stage = %self.name, %err, dropped, "stage cancelled while sending");
                            break 'items;
                        }
                        self.metrics.record_emitted();
                    }
                }
                Err(err) => {
                    self.metrics.record_failed();
                    warn!(stage = %self.name, %err, "stage failed to process item");
                }
            }
        }
    }
}

/// Spawn a single stage instance on its own thread
pub fn spawn_stage<In, Out, S>(
    tasks: &mut TaskGroup,
    name: &str,
    input: BoundedQueue<In>,
    output: BoundedQueue<Out>,
    node: &CancelNode,
    metrics: StageMetrics,
    stage: S,
) -> Result<()>
where
    In: Send + 'static,
    Out: Send + 'static,
    S: Stage<In, Out>,
{
    let runner = StageRunner::new(name, input, output, node.clone(), metrics);
    tasks.spawn(name.to_string(), move || runner.run(stage))?;
    Ok(())
}

/// A simple pass-through stage for testing
#[derive(Debug, Default)]
pub struct PassthroughStage;

impl<T: Send + 'static> Stage<T, T> for PassthroughStage {
    fn process(&mut self, input: T) -> Result<Vec<T>> {
        Ok(vec![input])
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A filtering stage that passes through items matching a predicate
pub struct FilterStage<T, F> {
    name: String,
    predicate: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> FilterStage<T, F>
where
    F: FnMut(&T) -> bool + Send + 'static,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            _item: PhantomData,
        }
    }
}

impl<T, F> Stage<T, T> for FilterStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn process(&mut self, input: T) -> Result<Vec<T>> {
        if (self.predicate)(&input) {
            Ok(vec![input])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A mapping stage that transforms each item
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<In, Out, F> Stage<In, Out> for MapStage<F>
where
    F: FnMut(In) -> Result<Out> + Send + 'static,
{
    fn process(&mut self, input: In) -> Result<Vec<Out>> {
        Ok(vec![(self.mapper)(input)?])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A stage that expands each item into any number of outputs
pub struct FlatMapStage<F> {
    name: String,
    mapper: F,
}

impl<F> FlatMapStage<F> {
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<In, Out, F> Stage<In, Out> for FlatMapStage<F>
where
    F: FnMut(In) -> Result<Vec<Out>> + Send + 'static,
{
    fn process(&mut self, input: In) -> Result<Vec<Out>> {
        (self.mapper)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_passthrough_stage() {
        let mut stage = PassthroughStage;
        let output = Stage::<Vec<u8>, Vec<u8>>::process(&mut stage, vec![1, 2, 3]).unwrap();
        assert_eq!(output, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_filter_stage() {
        let mut stage = FilterStage::new("test_filter", |n: &u32| *n > 5);
        assert_eq!(stage.process(3).unwrap().len(), 0);
        assert_eq!(stage.process(7).unwrap(), vec![7]);
    }

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("double", |n: u32| -> Result<u32> { Ok(n * 2) });
        assert_eq!(stage.process(5).unwrap(), vec![10u32]);
    }

    #[test]
    fn test_flat_map_stage() {
        let mut stage = FlatMapStage::new("split", |line: String| -> Result<Vec<String>> {
            Ok(line.split(' ').map(str::to_string).collect())
        });
        assert_eq!(stage.process("a b".to_string()).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_runner_closes_output_when_input_drains() {
        let input = BoundedQueue::new(8);
        let output = BoundedQueue::new(8);
        let node = CancelNode::new();
        let metrics = StageMetrics::new();
        for i in 0..4u32 {
            input.send(i, &node).unwrap();
        }
        input.close().unwrap();

        let runner = StageRunner::new("square", input, output.clone(), node.clone(), metrics.clone());
        runner.run(MapStage::new("square", |n: u32| -> Result<u32> { Ok(n * n) }));

        let results: Vec<u32> = output.iter(&node).collect();
        assert_eq!(results, vec![0, 1, 4, 9]);
        assert!(output.is_closed());
        assert_eq!(metrics.total_received(), 4);
        assert_eq!(metrics.total_emitted(), 4);
    }

    #[test]
    fn test_runner_survives_failures_and_panics() {
        let input = BoundedQueue::new(8);
        let output = BoundedQueue::new(8);
        let node = CancelNode::new();
        let metrics = StageMetrics::new();
        for i in 0..4u32 {
            input.send(i, &node).unwrap();
        }
        input.close().unwrap();

        let runner = StageRunner::new("flaky", input, output.clone(), node.clone(), metrics.clone());
        runner.run(MapStage::new("flaky", |n: u32| -> Result<u32> {
            match n {
                1 => Err(PipelineError::job("odd one out")),
                2 => panic!("boom"),
                n => Ok(n),
            }
        }));

        let results: Vec<u32> = output.iter(&node).collect();
        assert_eq!(results, vec![0, 3]);
        assert_eq!(metrics.total_failed(), 2);
    }

    #[test]
    fn test_runner_stops_on_cancel() {
        let input: BoundedQueue<u32> = BoundedQueue::new(1);
        let output: BoundedQueue<u32> = BoundedQueue::new(1);
        let node = CancelNode::new();
        let mut tasks = TaskGroup::new("test");
        spawn_stage(
            &mut tasks,
            "idle",
            input,
            output.clone(),
            &node,
            StageMetrics::new(),
            PassthroughStage,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        node.cancel();
        assert!(tasks.wait_until(Instant::now() + Duration::from_secs(2)));
        assert!(output.is_closed());
    }

    #[test]
    fn test_unsent_outputs_are_counted_as_dropped() {
        let input = BoundedQueue::new(1);
        let output: BoundedQueue<u32> = BoundedQueue::new(1);
        let node = CancelNode::new();
        let metrics = StageMetrics::new();
        let mut tasks = TaskGroup::new("test");
        spawn_stage(
            &mut tasks,
            "triple",
            input.clone(),
            output.clone(),
            &node,
            metrics.clone(),
            FlatMapStage::new("triple", |n: u32| -> Result<Vec<u32>> { Ok(vec![n, n, n]) }),
        )
        .unwrap();
        input.send(5, &node).unwrap();

        // The first copy fits, the second blocks on the full output.
        while metrics.total_emitted() < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        node.cancel();
        assert!(tasks.wait_until(Instant::now() + Duration::from_secs(2)));

        assert_eq!(output.len(), 1);
        assert_eq!(metrics.total_emitted(), 1);
        assert_eq!(metrics.total_dropped(), 2);
    }
}
