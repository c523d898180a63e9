// Slow log I/O health signal
// Flushes slower than the configured threshold raise a rate-limited
// health event; the counter is exposed for tests and operators.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Watches flush latency and raises a health signal when the stream is
/// slower than the operator's tolerance. Reports are rate-limited so a
/// persistently slow disk does not flood the log.
pub struct IoHealthMonitor {
    slow_log_io_duration: Duration,
    min_report_interval: Duration,
    last_report: Mutex<Option<Instant>>,
    reports: AtomicU64,
}

impl IoHealthMonitor {
    pub fn new(slow_log_io_duration: Duration) -> Self {
        Self {
            slow_log_io_duration,
            min_report_interval: Duration::from_secs(60),
            last_report: Mutex::new(None),
            reports: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn with_report_interval(slow_log_io_duration: Duration, interval: Duration) -> Self {
        Self {
            slow_log_io_duration,
            min_report_interval: interval,
            last_report: Mutex::new(None),
            reports: AtomicU64::new(0),
        }
    }

    /// Record one flush. Returns true when a health signal was raised.
    pub fn observe_flush(&self, latency: Duration, bytes: u64) -> bool {
        if self.slow_log_io_duration.is_zero() || latency < self.slow_log_io_duration {
            return false;
        }

        let mut last = self.last_report.lock();
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.min_report_interval {
                return false;
            }
        }
        *last = Some(now);
        self.reports.fetch_add(1, Ordering::SeqCst);

        warn!(
            latency_ms = latency.as_millis() as u64,
            bytes,
            threshold_ms = self.slow_log_io_duration.as_millis() as u64,
            "slow log flush"
        );
        true
    }

    /// Number of health signals raised so far.
    pub fn report_count(&self) -> u64 {
        self.reports.load(Ordering::SeqCst)
    }
}
