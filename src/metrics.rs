use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of recent durations, queried for percentiles
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    window_size: usize,
}

impl LatencyTracker {
    /// Create a tracker that keeps the last `window_size` samples
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Percentile `p` in `[0, 1]` of the window, in microseconds
    pub fn percentile_us(&self, p: f64) -> f64 {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * p.clamp(0.0, 1.0)).ceil() as usize).saturating_sub(1);
        sorted[rank].as_nanos() as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Aggregate job counters for a worker pool.
///
/// Written by workers and the shutdown coordinator, readable at any time.
/// Each submitted job ends in exactly one of completed, failed, timed out or
/// cancelled.
#[derive(Debug, Clone)]
pub struct PoolStats {
    inner: Arc<PoolCounters>,
    latency: LatencyTracker,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
    timed_out: CachePadded<AtomicU64>,
    cancelled: CachePadded<AtomicU64>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolCounters::default()),
            latency: LatencyTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.inner.submitted.fetch_add(1, Ordering::AcqRel);
    }

    /// Roll back a submission whose enqueue failed
    pub(crate) fn retract_submitted(&self) {
        self.inner.submitted.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn record_completed(&self, duration: Duration) {
        self.latency.record(duration);
        self.inner.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failed(&self, duration: Duration) {
        self.latency.record(duration);
        self.inner.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_timed_out(&self, duration: Duration) {
        self.latency.record(duration);
        self.inner.timed_out.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_cancelled(&self, count: u64) {
        self.inner.cancelled.fetch_add(count, Ordering::AcqRel);
    }

    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Acquire)
    }

    pub fn timed_out(&self) -> u64 {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    pub fn cancelled(&self) -> u64 {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Read-only point-in-time copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.start_time.elapsed();
        // Terminal counters first so the copy never shows more finished than submitted.
        let completed = self.completed();
        let failed = self.failed();
        let timed_out = self.timed_out();
        let cancelled = self.cancelled();
        let submitted = self.submitted();
        let finished = completed + failed + timed_out;
        StatsSnapshot {
            submitted,
            completed,
            failed,
            timed_out,
            cancelled,
            throughput_jps: if elapsed.as_secs_f64() == 0.0 {
                0.0
            } else {
                finished as f64 / elapsed.as_secs_f64()
            },
            latency_p50_us: self.latency.percentile_us(0.50),
            latency_p95_us: self.latency.percentile_us(0.95),
            latency_p99_us: self.latency.percentile_us(0.99),
            elapsed,
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of pool counters at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub throughput_jps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Jobs whose Result was delivered
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }

    /// Jobs submitted but never delivered: cancelled or still unaccounted for
    pub fn abandoned(&self) -> u64 {
        self.submitted.saturating_sub(self.finished())
    }

    /// Jobs queued or executing right now
    pub fn in_flight(&self) -> u64 {
        self.abandoned().saturating_sub(self.cancelled)
    }

    /// Format as a human-readable line
    pub fn format(&self) -> String {
        format!(
            "Submitted: {}, Completed: {}, Failed: {}, Timed out: {}, Cancelled: {}, \
             Throughput: {:.2} jobs/s, Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.submitted,
            self.completed,
            self.failed,
            self.timed_out,
            self.cancelled,
            self.throughput_jps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Per-stage metrics collector, shared by every instance of a stage
#[derive(Debug, Clone)]
pub struct StageMetrics {
    received: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    latency: LatencyTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            latency: LatencyTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Outputs produced but never delivered downstream because the stage was
    /// cancelled while sending them
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency.record(latency);
    }

    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items received per second since the stage was created
    pub fn throughput_mps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_received() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_received: self.total_received(),
            total_emitted: self.total_emitted(),
            total_failed: self.total_failed(),
            total_dropped: self.total_dropped(),
            throughput_mps: self.throughput_mps(),
            latency_p50_us: self.latency.percentile_us(0.50),
            latency_p95_us: self.latency.percentile_us(0.95),
            latency_p99_us: self.latency.percentile_us(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of one stage's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_received: u64,
    pub total_emitted: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    pub throughput_mps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Received: {}, Emitted: {}, Failed: {}, Dropped: {}, Throughput: {:.2} msg/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_received,
            self.total_emitted,
            self.total_failed,
            self.total_dropped,
            self.throughput_mps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_percentiles() {
        let tracker = LatencyTracker::new(10);
        for i in 1..=10 {
            tracker.record(Duration::from_micros(i));
        }
        assert_eq!(tracker.percentile_us(0.50), 5.0);
        assert_eq!(tracker.percentile_us(0.99), 10.0);
        assert_eq!(tracker.count(), 10);
    }

    #[test]
    fn test_latency_window_evicts_oldest() {
        let tracker = LatencyTracker::new(2);
        tracker.record(Duration::from_micros(100));
        tracker.record(Duration::from_micros(1));
        tracker.record(Duration::from_micros(2));
        assert_eq!(tracker.percentile_us(1.0), 2.0);
    }

    #[test]
    fn test_pool_stats_accounting() {
        let stats = PoolStats::new();
        for _ in 0..5 {
            stats.record_submitted();
        }
        stats.record_completed(Duration::from_millis(1));
        stats.record_failed(Duration::from_millis(1));
        stats.record_timed_out(Duration::from_millis(1));
        stats.record_cancelled(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.finished(), 3);
        assert_eq!(snapshot.abandoned(), 2);
        assert_eq!(snapshot.in_flight(), 1);
    }

    #[test]
    fn test_retracted_submission() {
        let stats = PoolStats::new();
        stats.record_submitted();
        stats.retract_submitted();
        assert_eq!(stats.submitted(), 0);
    }

    #[test]
    fn test_stage_metrics() {
        let metrics = StageMetrics::new();
        for _ in 0..100 {
            metrics.record_received();
            metrics.record_emitted();
            metrics.record_latency(Duration::from_micros(1));
        }
        metrics.record_failed();
        metrics.record_dropped(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_received, 100);
        assert_eq!(snapshot.total_failed, 1);
        assert_eq!(snapshot.total_dropped, 2);
        assert!(snapshot.latency_p99_us > 0.0);
    }
}
