//! Fixed-size worker pool over bounded job and result queues.
//!
//! `n` long-lived workers compete for jobs on one shared queue; whichever
//! worker is ready next takes the next job, so distribution is roughly even
//! under steady load but not guaranteed fair under bursts. Each job runs behind
//! a panic boundary: a failing or panicking job becomes a failed
//! [`JobResult`] and never takes its worker down.
//!
//! The last worker to exit closes the result queue, so consumers can simply
//! receive until the queue reports closed-and-drained.

use crate::cancel::{CancelNode, CancelReason};
use crate::config::{EngineConfig, SubmitMode};
use crate::error::{panic_message, PipelineError, Result};
use crate::job::{Job, JobId, JobResult};
use crate::metrics::{PoolStats, StatsSnapshot};
use crate::queue::BoundedQueue;
use crate::rate_limit::RateLimiter;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReport, ShutdownState, TaskGroup};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The user function a pool runs for every job.
///
/// It receives the job and a node scoped to that job (carrying the per-job
/// deadline, if configured). Long-running jobs should observe the node.
pub type JobFn<P, R> = dyn Fn(&Job<P>, &CancelNode) -> Result<R> + Send + Sync;

/// What a worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Busy = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Busy,
            _ => WorkerState::Stopped,
        }
    }
}

/// Producer-side handle to a pool's job queue. Cheap to clone.
pub struct Submitter<P> {
    jobs: BoundedQueue<Job<P>>,
    node: CancelNode,
    stats: PoolStats,
    next_id: Arc<AtomicU64>,
    limiter: Option<RateLimiter>,
    mode: SubmitMode,
}

impl<P> Clone for Submitter<P> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
            node: self.node.clone(),
            stats: self.stats.clone(),
            next_id: Arc::clone(&self.next_id),
            limiter: self.limiter.clone(),
            mode: self.mode,
        }
    }
}

impl<P: Send + 'static> Submitter<P> {
    fn next_job(&self, payload: P) -> Job<P> {
        Job::new(JobId(self.next_id.fetch_add(1, Ordering::Relaxed)), payload)
    }

    /// Submit according to the configured [`SubmitMode`]
    pub fn submit(&self, payload: P) -> Result<JobId> {
        match self.mode {
            SubmitMode::Blocking => self.submit_blocking(payload),
            SubmitMode::NonBlocking => self.try_submit(payload),
        }
    }

    /// Wait for a rate-limit token and a free slot
    pub fn submit_blocking(&self, payload: P) -> Result<JobId> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(&self.node)?;
        }
        let job = self.next_job(payload);
        let id = job.id();
        self.stats.record_submitted();
        if let Err(err) = self.jobs.send(job, &self.node) {
            self.stats.retract_submitted();
            return Err(err);
        }
        Ok(id)
    }

    /// Never blocks. A missing rate-limit token or a full queue both report
    /// `QueueFull`; the caller decides whether to retry or drop.
    pub fn try_submit(&self, payload: P) -> Result<JobId> {
        self.node.check()?;
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                return Err(PipelineError::QueueFull);
            }
        }
        let job = self.next_job(payload);
        let id = job.id();
        self.stats.record_submitted();
        if let Err(err) = self.jobs.try_send(job) {
            self.stats.retract_submitted();
            return Err(err.into());
        }
        Ok(id)
    }
}

/// One long-lived worker. Dropping it marks the worker stopped and, for the
/// last worker, closes the result queue.
struct Worker<P: Send + 'static, R: Send + 'static> {
    id: usize,
    pool: String,
    jobs: BoundedQueue<Job<P>>,
    results: BoundedQueue<JobResult<R>>,
    node: CancelNode,
    stats: PoolStats,
    states: Arc<Vec<AtomicU8>>,
    live: Arc<AtomicUsize>,
    per_job_timeout: Option<Duration>,
    job_fn: Arc<JobFn<P, R>>,
}

enum Delivered {
    Completed,
    Failed,
    TimedOut,
}

impl<P: Send + 'static, R: Send + 'static> Worker<P, R> {
    fn set_state(&self, state: WorkerState) {
        self.states[self.id].store(state as u8, Ordering::Release);
    }

    fn run(self) {
        debug!(pool = %self.pool, worker = self.id, "worker started");
        loop {
            let job = match self.jobs.receive(&self.node) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(pool = %self.pool, worker = self.id, "job queue drained");
                    break;
                }
                Err(err) => {
                    debug!(pool = %self.pool, worker = self.id, %err, "worker cancelled");
                    break;
                }
            };

            self.set_state(WorkerState::Busy);
            let keep_going = self.execute(job);
            self.set_state(WorkerState::Idle);
            if !keep_going {
                break;
            }
        }
    }

    /// Run one job and deliver its result. Returns false once the pool is
    /// cancelled and the worker should stop.
    fn execute(&self, job: Job<P>) -> bool {
        let job_node = match self.per_job_timeout {
            Some(timeout) => self.node.child_with_timeout(timeout),
            None => self.node.child(),
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.job_fn)(&job, &job_node)))
            .unwrap_or_else(|payload| {
                let message = panic_message(&*payload);
                warn!(pool = %self.pool, worker = self.id, job = %job.id(), %message, "job panicked");
                Err(PipelineError::Panicked(message))
            });
        let duration = start.elapsed();

        if self.node.is_done() {
            debug!(pool = %self.pool, worker = self.id, job = %job.id(), "job abandoned");
            self.stats.record_cancelled(1);
            return false;
        }

        let (outcome, delivered) = if job_node.reason() == Some(CancelReason::DeadlineExceeded) {
            (Err(PipelineError::DeadlineExceeded), Delivered::TimedOut)
        } else {
            match outcome {
                Ok(value) => (Ok(value), Delivered::Completed),
                Err(err) => (Err(err), Delivered::Failed),
            }
        };
        let result = JobResult {
            job_id: job.id(),
            outcome,
            duration,
        };

        match self.results.send(result, &self.node) {
            Ok(()) => {
                match delivered {
                    Delivered::Completed => self.stats.record_completed(duration),
                    Delivered::Failed => self.stats.record_failed(duration),
                    Delivered::TimedOut => self.stats.record_timed_out(duration),
                }
                true
            }
            Err(err) => {
                debug!(pool = %self.pool, worker = self.id, job = %job.id(), %err, "result not delivered");
                self.stats.record_cancelled(1);
                false
            }
        }
    }
}

impl<P: Send + 'static, R: Send + 'static> Drop for Worker<P, R> {
    fn drop(&mut self) {
        self.set_state(WorkerState::Stopped);
        release_workers(&self.live, 1, &self.results);
        debug!(pool = %self.pool, worker = self.id, "worker stopped");
    }
}

fn release_workers<R: Send + 'static>(
    live: &AtomicUsize,
    count: usize,
    results: &BoundedQueue<JobResult<R>>,
) {
    if live.fetch_sub(count, Ordering::AcqRel) == count {
        if let Err(err) = results.close() {
            debug!(%err, "result queue already closed");
        }
    }
}

/// A running pool of `n` workers
pub struct WorkerPool<P: Send + 'static, R: Send + 'static> {
    config: EngineConfig,
    submitter: Submitter<P>,
    jobs: BoundedQueue<Job<P>>,
    results: BoundedQueue<JobResult<R>>,
    stats: PoolStats,
    states: Arc<Vec<AtomicU8>>,
    node: CancelNode,
    coordinator: ShutdownCoordinator,
}

impl<P: Send + 'static, R: Send + 'static> WorkerPool<P, R> {
    /// Create the job and result queues from `config` and start the workers.
    ///
    /// The pool's node is a child of `parent`; cancelling `parent` stops the pool.
    pub fn start<F>(config: EngineConfig, parent: &CancelNode, job_fn: F) -> Result<Self>
    where
        F: Fn(&Job<P>, &CancelNode) -> Result<R> + Send + Sync + 'static,
    {
        config.validate()?;
        let jobs = BoundedQueue::new(config.queue_capacity);
        let results = BoundedQueue::new(config.result_capacity());
        Self::with_queues(config, jobs, results, parent, job_fn)
    }

    /// Start `config.workers` workers on caller-provided queues.
    ///
    /// The pool becomes the single closer of `results`. `jobs` is closed by
    /// [`shutdown`](Self::shutdown) unless its owner closed it first.
    pub fn with_queues<F>(
        config: EngineConfig,
        jobs: BoundedQueue<Job<P>>,
        results: BoundedQueue<JobResult<R>>,
        parent: &CancelNode,
        job_fn: F,
    ) -> Result<Self>
    where
        F: Fn(&Job<P>, &CancelNode) -> Result<R> + Send + Sync + 'static,
    {
        config.validate()?;
        let limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::from_config)
            .transpose()?;

        let node = parent.child();
        let stats = PoolStats::new();
        let job_fn: Arc<JobFn<P, R>> = Arc::new(job_fn);
        let states: Arc<Vec<AtomicU8>> = Arc::new(
            (0..config.workers)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
        );
        let live = Arc::new(AtomicUsize::new(config.workers));

        let mut tasks = TaskGroup::new(config.name.clone());
        for id in 0..config.workers {
            let worker = Worker {
                id,
                pool: config.name.clone(),
                jobs: jobs.clone(),
                results: results.clone(),
                node: node.clone(),
                stats: stats.clone(),
                states: Arc::clone(&states),
                live: Arc::clone(&live),
                per_job_timeout: config.per_job_timeout,
                job_fn: Arc::clone(&job_fn),
            };
            let spawned = tasks.spawn(format!("{}-worker-{}", config.name, id), move || worker.run());
            if let Err(err) = spawned {
                // The worker that failed to spawn released itself on drop.
                let never_started = config.workers - id - 1;
                if never_started > 0 {
                    release_workers(&live, never_started, &results);
                }
                node.cancel();
                return Err(err);
            }
        }
        debug!(pool = %config.name, workers = config.workers, "worker pool started");

        let submitter = Submitter {
            jobs: jobs.clone(),
            node: node.clone(),
            stats: stats.clone(),
            next_id: Arc::new(AtomicU64::new(0)),
            limiter,
            mode: config.submit_mode,
        };

        Ok(Self {
            coordinator: ShutdownCoordinator::new(node.clone(), tasks),
            config,
            submitter,
            jobs,
            results,
            stats,
            states,
            node,
        })
    }

    /// Submit a payload as a new job, per the configured submit mode
    pub fn submit(&self, payload: P) -> Result<JobId> {
        self.submitter.submit(payload)
    }

    /// Submit without blocking; `QueueFull` if there is no room
    pub fn try_submit(&self, payload: P) -> Result<JobId> {
        self.submitter.try_submit(payload)
    }

    /// A cloneable handle for producer threads
    pub fn submitter(&self) -> Submitter<P> {
        self.submitter.clone()
    }

    /// The queue results are delivered on
    pub fn results(&self) -> BoundedQueue<JobResult<R>> {
        self.results.clone()
    }

    /// Read-only snapshot of the pool counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, for monitoring from another thread
    pub fn stats_handle(&self) -> PoolStats {
        self.stats.clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Acquire)))
            .collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node(&self) -> &CancelNode {
        &self.node
    }

    pub fn state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    /// Abort everything now: blocked submitters, workers and consumers on the
    /// pool's node return `Cancelled`
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Shut down with the configured grace period
    pub fn shutdown_graceful(self) -> ShutdownReport<StatsSnapshot> {
        let grace = self.config.grace_period;
        self.shutdown(grace)
    }

    /// Stop intake, let workers drain the queue for up to `grace`, then cancel.
    ///
    /// Jobs still queued after a forced cancel are counted as cancelled, so the
    /// returned stats account for every submitted job.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownReport<StatsSnapshot> {
        let jobs = self.jobs.clone();
        let stats = self.stats.clone();
        let pool = self.config.name.clone();

        self.coordinator.shutdown(
            grace,
            || {
                if let Err(err) = jobs.close() {
                    debug!(pool = %pool, %err, "job queue already closed by its owner");
                }
            },
            |outcome| {
                if outcome == ShutdownOutcome::TimedOut {
                    let leftover = jobs.drain().len() as u64;
                    if leftover > 0 {
                        stats.record_cancelled(leftover);
                    }
                }
                stats.snapshot()
            },
        )
    }
}

impl ShutdownReport<StatsSnapshot> {
    /// Jobs whose result was delivered
    pub fn completed(&self) -> u64 {
        self.stats.finished()
    }

    /// Jobs submitted but not delivered
    pub fn abandoned(&self) -> u64 {
        self.stats.abandoned()
    }
}
