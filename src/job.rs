use crate::error::PipelineError;
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of a submitted job, unique within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A unit of submitted work. Immutable once created.
#[derive(Debug, Clone)]
pub struct Job<P> {
    id: JobId,
    payload: P,
    submitted_at: Instant,
}

impl<P> Job<P> {
    /// Create a job stamped with the current time
    pub fn new(id: JobId, payload: P) -> Self {
        Self {
            id,
            payload,
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Time spent since submission
    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Outcome of executing one job, produced exactly once per job
#[derive(Debug)]
pub struct JobResult<R> {
    pub job_id: JobId,
    pub outcome: Result<R, PipelineError>,
    /// Wall time spent executing the job function
    pub duration: Duration,
}

impl<R> JobResult<R> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }
}
