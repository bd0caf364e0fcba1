//! A concurrent pipeline-processing engine.
//!
//! Bounded queues connect producers, a fixed-size worker pool or a chain of
//! pipeline stages, and consumers. Every blocking operation takes a
//! [`CancelNode`], so cancelling one node in the tree (or letting its deadline
//! pass) releases everything blocked beneath it.
//!
//! # Features
//!
//! - Cancellation tree with composable deadlines
//! - Bounded FIFO queues with close-then-drain semantics
//! - Worker pool with panic isolation, per-job timeouts and live stats
//! - Pipeline stages with fan-out/fan-in and per-stage metrics
//! - Token-bucket rate limiting that never busy-waits
//! - Two-phase graceful shutdown reporting completed vs abandoned work
//!
//! # Example
//!
//! ```no_run
//! use pipeline_engine::{CancelNode, EngineConfig, Job, WorkerPool};
//! use std::time::Duration;
//!
//! # fn main() -> pipeline_engine::Result<()> {
//! let root = CancelNode::new();
//! let config = EngineConfig::builder().workers(4).queue_capacity(32).build()?;
//! let pool = WorkerPool::start(config, &root, |job: &Job<u64>, _node: &CancelNode| {
//!     Ok(job.payload() * 2)
//! })?;
//!
//! let results = pool.results();
//! for n in 0..10 {
//!     pool.submit(n)?;
//! }
//! let report = pool.shutdown(Duration::from_secs(1));
//! let consumer = CancelNode::new();
//! for result in results.iter(&consumer) {
//!     println!("{}: {:?}", result.job_id, result.outcome);
//! }
//! println!("{}", report.stats.format());
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod fan;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod rate_limit;
pub mod shutdown;
pub mod stage;

// Re-exports for convenience
pub use cancel::{CancelNode, CancelReason};
pub use config::{EngineConfig, EngineConfigBuilder, RateLimitConfig, SubmitMode};
pub use error::{PipelineError, Result};
pub use fan::{fan_in, fan_out};
pub use job::{Job, JobId, JobResult};
pub use metrics::{LatencyTracker, MetricsSnapshot, PoolStats, StageMetrics, StatsSnapshot};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};
pub use pool::{Submitter, WorkerPool, WorkerState};
pub use queue::{BoundedQueue, ReceiveIter, TryReceiveIter, TrySendError};
pub use rate_limit::RateLimiter;
pub use shutdown::{
    ShutdownCoordinator, ShutdownOutcome, ShutdownReport, ShutdownState, TaskGroup,
};
pub use stage::{FilterStage, FlatMapStage, MapStage, PassthroughStage, Stage, StageRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
