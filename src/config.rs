//! Engine configuration.
//!
//! ```ignore
//! let config = EngineConfig::builder()
//!     .workers(4)
//!     .queue_capacity(128)
//!     .rate_limit(200.0, 20)
//!     .per_job_timeout(Duration::from_secs(2))
//!     .grace_period(Duration::from_secs(10))
//!     .build()?;
//! ```
//!
//! The struct also deserializes with serde; durations use humantime strings
//! such as `"250ms"` or `"5s"`.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How `submit` behaves when the job queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for space (or cancellation)
    #[default]
    Blocking,
    /// Fail immediately with `QueueFull`
    NonBlocking,
}

/// Token-bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub tokens_per_second: f64,
    pub burst: u32,
}

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for worker thread names and log fields
    pub name: String,
    /// Number of long-lived workers (defaults to available parallelism)
    pub workers: usize,
    /// Capacity of the job queue
    pub queue_capacity: usize,
    /// Capacity of the result queue (defaults to `queue_capacity`)
    pub result_capacity: Option<usize>,
    /// Throttle for submissions
    pub rate_limit: Option<RateLimitConfig>,
    /// Deadline applied to each job from the moment a worker picks it up
    #[serde(with = "humantime_serde")]
    pub per_job_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight work before cancelling it
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub submit_mode: SubmitMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            workers: default_workers(),
            queue_capacity: 64,
            result_capacity: None,
            rate_limit: None,
            per_job_timeout: None,
            grace_period: Duration::from_secs(5),
            submit_mode: SubmitMode::Blocking,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// `workers` workers on a queue of `queue_capacity`, defaults elsewhere
    pub fn with_workers(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers,
            queue_capacity,
            ..Self::default()
        }
    }

    pub fn result_capacity(&self) -> usize {
        self.result_capacity.unwrap_or(self.queue_capacity)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::ConfigError(
                "workers must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.result_capacity == Some(0) {
            return Err(PipelineError::ConfigError(
                "result_capacity must be at least 1".into(),
            ));
        }
        if let Some(limit) = &self.rate_limit {
            if !limit.tokens_per_second.is_finite() || limit.tokens_per_second <= 0.0 {
                return Err(PipelineError::ConfigError(format!(
                    "rate_limit.tokens_per_second must be positive, got {}",
                    limit.tokens_per_second
                )));
            }
            if limit.burst == 0 {
                return Err(PipelineError::ConfigError(
                    "rate_limit.burst must be at least 1".into(),
                ));
            }
        }
        if self.per_job_timeout == Some(Duration::ZERO) {
            return Err(PipelineError::ConfigError(
                "per_job_timeout must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for EngineConfig with method chaining
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn result_capacity(mut self, capacity: usize) -> Self {
        self.config.result_capacity = Some(capacity);
        self
    }

    /// Throttle submissions to `tokens_per_second` with bursts of up to `burst`
    pub fn rate_limit(mut self, tokens_per_second: f64, burst: u32) -> Self {
        self.config.rate_limit = Some(RateLimitConfig {
            tokens_per_second,
            burst,
        });
        self
    }

    pub fn per_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_job_timeout = Some(timeout);
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.grace_period = grace_period;
        self
    }

    pub fn submit_mode(mut self, mode: SubmitMode) -> Self {
        self.config.submit_mode = mode;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.result_capacity(), 64);
        assert_eq!(config.submit_mode, SubmitMode::Blocking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_validates() {
        let err = EngineConfig::builder().workers(0).build().unwrap_err();
        assert!(matches!(err, PipelineError::ConfigError(_)));

        let err = EngineConfig::builder()
            .rate_limit(-1.0, 5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("tokens_per_second"));

        let config = EngineConfig::builder()
            .workers(2)
            .queue_capacity(8)
            .result_capacity(16)
            .build()
            .unwrap();
        assert_eq!(config.result_capacity(), 16);
    }

    #[test]
    fn test_deserialize_with_humantime_durations() {
        let json = r#"{
            "workers": 3,
            "queue_capacity": 10,
            "rate_limit": { "tokens_per_second": 100.0, "burst": 10 },
            "per_job_timeout": "250ms",
            "grace_period": "2s",
            "submit_mode": "non_blocking"
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.per_job_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.submit_mode, SubmitMode::NonBlocking);
        assert_eq!(config.name, "pool");
        assert!(config.validate().is_ok());
    }
}
