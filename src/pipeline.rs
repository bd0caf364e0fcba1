use crate::cancel::CancelNode;
use crate::error::{PipelineError, Result};
use crate::fan::{fan_out, merge};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::queue::{BoundedQueue, TrySendError};
use crate::rate_limit::RateLimiter;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReport, ShutdownState, TaskGroup};
use crate::stage::{spawn_stage, Stage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Empties one queue between stages, returning how many items it held
type DrainFn = Box<dyn Fn() -> usize + Send + Sync>;

fn drainer<T: Send + 'static>(queue: &BoundedQueue<T>) -> DrainFn {
    let queue = queue.clone();
    Box::new(move || queue.drain().len())
}

/// Cancels the pipeline's node if the builder is dropped before `build`,
/// so stages already running do not block forever.
struct CancelOnDrop {
    node: Option<CancelNode>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.node.take();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.cancel();
        }
    }
}

/// Builder for constructing pipelines.
///
/// Each call to [`stage`](Self::stage) starts that stage immediately, reading
/// the previous stage's output. `Out` tracks the item type at the current tail.
pub struct PipelineBuilder<In, Out> {
    node: CancelNode,
    capacity: usize,
    input: BoundedQueue<In>,
    tail: BoundedQueue<Out>,
    /// Every queue upstream of the tail, the input included
    upstream: Vec<DrainFn>,
    tasks: TaskGroup,
    stages: Vec<(String, StageMetrics)>,
    limiter: Option<RateLimiter>,
    guard: CancelOnDrop,
}

impl<In: Send + 'static> PipelineBuilder<In, In> {
    /// Create a builder whose queues all hold `capacity` items.
    ///
    /// The pipeline runs under a child of `parent`.
    pub fn new(capacity: usize, parent: &CancelNode) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::ConfigError(
                "pipeline queue capacity must be greater than zero".into(),
            ));
        }
        let node = parent.child();
        let input = BoundedQueue::new(capacity);
        Ok(Self {
            guard: CancelOnDrop {
                node: Some(node.clone()),
            },
            node,
            capacity,
            tail: input.clone(),
            input,
            upstream: Vec::new(),
            tasks: TaskGroup::new("pipeline"),
            stages: Vec::new(),
            limiter: None,
        })
    }
}

impl<In: Send + 'static, Out: Send + 'static> PipelineBuilder<In, Out> {
    /// Append a stage run by `parallelism` instances.
    ///
    /// With one instance the stage reads the tail directly. With more, the
    /// instances share the tail (fan-out) and their outputs are merged back into
    /// one queue (fan-in); output order across instances is then unspecified.
    pub fn stage<Next, S, F>(
        mut self,
        name: impl Into<String>,
        parallelism: usize,
        mut factory: F,
    ) -> Result<PipelineBuilder<In, Next>>
    where
        Next: Send + 'static,
        S: Stage<Out, Next>,
        F: FnMut(usize) -> S,
    {
        let name = name.into();
        let metrics = StageMetrics::new();

        let output = if parallelism == 1 {
            let output = BoundedQueue::new(self.capacity);
            spawn_stage(
                &mut self.tasks,
                &name,
                self.tail.clone(),
                output.clone(),
                &self.node,
                metrics.clone(),
                factory(0),
            )?;
            output
        } else {
            let outputs = fan_out(
                &mut self.tasks,
                &name,
                &self.tail,
                parallelism,
                &self.node,
                &metrics,
                factory,
            )?;
            self.upstream.extend(outputs.iter().map(drainer));
            merge(&mut self.tasks, &name, outputs, self.capacity, &self.node, &metrics)?
        };
        debug!(stage = %name, parallelism, "pipeline stage started");
        self.stages.push((name, metrics));
        self.upstream.push(drainer(&self.tail));

        Ok(PipelineBuilder {
            node: self.node,
            capacity: self.capacity,
            input: self.input,
            tail: output,
            upstream: self.upstream,
            tasks: self.tasks,
            stages: self.stages,
            limiter: self.limiter,
            guard: self.guard,
        })
    }

    /// Throttle [`Pipeline::send`] with a token bucket
    pub fn rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Finish the pipeline
    pub fn build(self) -> Result<Pipeline<In, Out>> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        let PipelineBuilder {
            node,
            input,
            tail,
            upstream,
            tasks,
            stages,
            limiter,
            guard,
            ..
        } = self;
        guard.disarm();

        Ok(Pipeline {
            coordinator: ShutdownCoordinator::new(node.clone(), tasks),
            input,
            output: tail,
            upstream,
            sent: AtomicU64::new(0),
            node,
            stages,
            limiter,
        })
    }
}

/// Per-stage metrics captured at shutdown
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub stages: Vec<(String, MetricsSnapshot)>,
    /// Items accepted by [`Pipeline::send`] and [`Pipeline::try_send`]
    pub sent: u64,
    /// Items lost inside the pipeline: left on the input or an intermediate
    /// queue, or held by a stage or fan-in when it was cancelled. Whatever
    /// already reached the output stays there and is not counted.
    pub abandoned: u64,
}

/// A running chain of stages connected by bounded queues
pub struct Pipeline<In, Out> {
    input: BoundedQueue<In>,
    output: BoundedQueue<Out>,
    upstream: Vec<DrainFn>,
    sent: AtomicU64,
    node: CancelNode,
    stages: Vec<(String, StageMetrics)>,
    limiter: Option<RateLimiter>,
    coordinator: ShutdownCoordinator,
}

impl<In: Send + 'static, Out: Send + 'static> Pipeline<In, Out> {
    /// Feed one item into the first stage, waiting for the rate limiter and
    /// for space.
    pub fn send(&self, item: In) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(&self.node)?;
        }
        self.input.send(item, &self.node)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Feed one item without blocking. A missing rate-limit token counts as full.
    pub fn try_send(&self, item: In) -> std::result::Result<(), TrySendError<In>> {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                return Err(TrySendError::Full(item));
            }
        }
        self.input.try_send(item)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the next result from the last stage; `None` once the pipeline has
    /// finished and the output is drained.
    pub fn receive(&self) -> Result<Option<Out>> {
        self.output.receive(&self.node)
    }

    /// Items accepted so far; direct sends on [`input`](Self::input) are not
    /// counted
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Get the input queue of the first stage
    pub fn input(&self) -> BoundedQueue<In> {
        self.input.clone()
    }

    /// Get the output queue of the last stage
    pub fn output(&self) -> BoundedQueue<Out> {
        self.output.clone()
    }

    /// Signal end of input; stages finish what is buffered and close in turn
    pub fn close_input(&self) -> Result<()> {
        self.input.close()
    }

    pub fn node(&self) -> &CancelNode {
        &self.node
    }

    pub fn cancel(&self) {
        self.node.cancel();
    }

    pub fn state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    /// Stage names with their live metrics, in pipeline order
    pub fn stage_metrics(&self) -> &[(String, StageMetrics)] {
        &self.stages
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for (name, metrics) in &self.stages {
            summary.push_str(&format!("  Stage {}: {}\n", name, metrics.snapshot().format()));
        }
        summary
    }

    /// Close the input and wait up to `grace` for every stage to drain.
    ///
    /// Stages only finish once their output has room, so something must keep
    /// consuming [`output`](Self::output) during the grace period. On timeout
    /// the pipeline is cancelled and every item that had not reached the
    /// output is dropped and counted in [`PipelineStats::abandoned`].
    pub fn shutdown(mut self, grace: Duration) -> ShutdownReport<PipelineStats> {
        let input = self.input.clone();
        let stages = self.stages.clone();
        let upstream = std::mem::take(&mut self.upstream);
        let sent = self.sent();

        self.coordinator.shutdown(
            grace,
            || {
                if let Err(err) = input.close() {
                    debug!(%err, "pipeline input already closed");
                }
            },
            |outcome| {
                // Stages have stopped, so nothing moves between these queues now.
                let queued: u64 = upstream.iter().map(|drain| drain() as u64).sum();
                let dropped: u64 = stages.iter().map(|(_, m)| m.total_dropped()).sum();
                if outcome == ShutdownOutcome::TimedOut {
                    debug!(queued, dropped, "pipeline work abandoned");
                }
                PipelineStats {
                    stages: stages
                        .iter()
                        .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
                        .collect(),
                    sent,
                    abandoned: queued + dropped,
                }
            },
        )
    }
}
