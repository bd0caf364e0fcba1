//! Two-phase graceful shutdown.
//!
//! `Running → Draining → {Completed | TimedOut}`. Draining closes the intake so
//! no new work arrives while in-flight work continues. If every task exits within
//! the grace period the shutdown is `Completed`; otherwise the shared
//! [`CancelNode`] is cancelled, forcing tasks to abandon their work, and the
//! shutdown is `TimedOut`.

use crate::cancel::CancelNode;
use crate::error::{PipelineError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lower bound on how long tasks get to acknowledge a forced cancel
const MIN_CANCEL_ACK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownState {
    Running,
    Draining,
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownOutcome {
    /// Every task finished within the grace period; no submitted work was lost
    Completed,
    /// The grace period ran out and remaining work was cancelled
    TimedOut,
}

/// What a shutdown achieved
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport<S> {
    pub outcome: ShutdownOutcome,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Tasks that ignored the forced cancel and were detached
    pub unresponsive: usize,
    pub stats: S,
}

impl<S> ShutdownReport<S> {
    pub fn is_completed(&self) -> bool {
        self.outcome == ShutdownOutcome::Completed
    }
}

/// Signals task exit on drop, including during unwinding
struct ExitSignal {
    tx: Sender<usize>,
    id: usize,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        // The coordinator may already have given up listening.
        let _ = self.tx.send(self.id);
    }
}

/// A set of named threads whose exits can be awaited against a deadline
pub struct TaskGroup {
    name: String,
    handles: Vec<Option<JoinHandle<()>>>,
    exit_tx: Option<Sender<usize>>,
    exit_rx: Receiver<usize>,
    #[cfg(test)]
    spawn_limit: Option<usize>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        let (exit_tx, exit_rx) = channel::unbounded();
        Self {
            name: name.into(),
            handles: Vec::new(),
            exit_tx: Some(exit_tx),
            exit_rx,
            #[cfg(test)]
            spawn_limit: None,
        }
    }

    /// Make every spawn after the first `limit` fail
    #[cfg(test)]
    pub(crate) fn limit_spawns(&mut self, limit: usize) {
        self.spawn_limit = Some(limit);
    }

    #[cfg(test)]
    fn check_spawn_limit(&self, id: usize) -> Result<()> {
        match self.spawn_limit {
            Some(limit) if id >= limit => Err(PipelineError::ThreadError(format!(
                "task group {} is out of threads",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn check_spawn_limit(&self, _id: usize) -> Result<()> {
        Ok(())
    }

    /// Spawn a named thread tracked by this group
    pub fn spawn<F>(&mut self, thread_name: String, task: F) -> Result<usize>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self
            .exit_tx
            .as_ref()
            .ok_or_else(|| {
                PipelineError::ThreadError(format!("task group {} is shutting down", self.name))
            })?
            .clone();
        let id = self.handles.len();
        self.check_spawn_limit(id)?;

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _exit = ExitSignal { tx, id };
                task();
            })
            .map_err(|e| {
                PipelineError::ThreadError(format!("failed to spawn {}: {}", thread_name, e))
            })?;

        self.handles.push(Some(handle));
        Ok(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks ever spawned
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Tasks not yet observed to exit
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    /// Wait until every task has exited or `deadline` passes.
    ///
    /// Returns `true` when all tasks exited. Stops accepting new tasks.
    pub fn wait_until(&mut self, deadline: Instant) -> bool {
        self.wait(Some(deadline))
    }

    /// Wait, without a deadline, until every task has exited. Stops accepting
    /// new tasks.
    pub fn wait_all(&mut self) {
        self.wait(None);
    }

    fn wait(&mut self, deadline: Option<Instant>) -> bool {
        self.exit_tx.take();
        loop {
            let exited = match deadline {
                Some(deadline) => self.exit_rx.recv_deadline(deadline),
                None => self
                    .exit_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match exited {
                Ok(id) => self.join(id),
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return self.running() == 0,
            }
        }
    }

    fn join(&mut self, id: usize) {
        if let Some(handle) = self.handles.get_mut(id).and_then(Option::take) {
            if handle.join().is_err() {
                warn!(group = %self.name, task = id, "task panicked");
            }
        }
    }

    /// Give up on tasks that have not exited; returns how many were detached
    pub fn detach(&mut self) -> usize {
        let mut detached = 0;
        for handle in self.handles.iter_mut() {
            if handle.take().is_some() {
                detached += 1;
            }
        }
        detached
    }
}

/// Drives the shutdown state machine for a group of tasks sharing one node
pub struct ShutdownCoordinator {
    state: Arc<Mutex<ShutdownState>>,
    node: CancelNode,
    tasks: TaskGroup,
}

impl ShutdownCoordinator {
    pub fn new(node: CancelNode, tasks: TaskGroup) -> Self {
        Self {
            state: Arc::new(Mutex::new(ShutdownState::Running)),
            node,
            tasks,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn node(&self) -> &CancelNode {
        &self.node
    }

    pub fn tasks_mut(&mut self) -> &mut TaskGroup {
        &mut self.tasks
    }

    fn transition(&self, next: ShutdownState) {
        let mut state = self.state.lock();
        debug!(group = %self.tasks.name(), from = ?*state, to = ?next, "shutdown transition");
        *state = next;
    }

    /// Stop intake, wait up to `grace` for tasks to finish, cancel if they don't.
    ///
    /// `close_intake` runs once on entering `Draining`. `collect` runs after the
    /// tasks have stopped (or been detached) and builds the report's stats.
    pub fn shutdown<S>(
        &mut self,
        grace: Duration,
        close_intake: impl FnOnce(),
        collect: impl FnOnce(ShutdownOutcome) -> S,
    ) -> ShutdownReport<S> {
        let start = Instant::now();
        self.transition(ShutdownState::Draining);
        close_intake();

        // A grace period past the end of the clock means no deadline at all.
        let (outcome, unresponsive) = if self.tasks.wait(start.checked_add(grace)) {
            (ShutdownOutcome::Completed, 0)
        } else {
            warn!(
                group = %self.tasks.name(),
                running = self.tasks.running(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed, cancelling in-flight work"
            );
            self.node.cancel();
            let ack_deadline = Instant::now().checked_add(grace.max(MIN_CANCEL_ACK));
            let unresponsive = if self.tasks.wait(ack_deadline) {
                0
            } else {
                let detached = self.tasks.detach();
                warn!(group = %self.tasks.name(), detached, "tasks ignored cancellation, detaching");
                detached
            };
            (ShutdownOutcome::TimedOut, unresponsive)
        };

        self.transition(match outcome {
            ShutdownOutcome::Completed => ShutdownState::Completed,
            ShutdownOutcome::TimedOut => ShutdownState::TimedOut,
        });
        // Release anything else still parked on this subtree.
        self.node.cancel();

        let stats = collect(outcome);
        let elapsed = start.elapsed();
        info!(
            group = %self.tasks.name(),
            outcome = ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "shutdown finished"
        );
        ShutdownReport {
            outcome,
            elapsed,
            unresponsive,
            stats,
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if self.state() == ShutdownState::Running {
            debug!(group = %self.tasks.name(), "dropped without shutdown, cancelling");
            self.node.cancel();
        }
    }
}
