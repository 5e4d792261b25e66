//! Latency tracking and the process-wide nanosecond clock.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic nanoseconds since the first call in this process.
///
/// Timestamps produced here are comparable across threads, which is all the
/// recvTs-to-ack latency measurement needs.
pub fn nanos_now() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

/// Periodically-reported latency histogram (max 10s, 3 significant figures).
///
/// `record` is called from one hot thread; `log_and_reset` from the metrics
/// ticker. The mutex is effectively uncontended.
pub struct LatencyStats {
    name: &'static str,
    hist: Mutex<Histogram<u64>>,
}

impl LatencyStats {
    pub fn new(name: &'static str) -> Self {
        let hist = Histogram::new_with_bounds(1, 10_000_000_000, 3).expect("histogram bounds");
        Self { name, hist: Mutex::new(hist) }
    }

    #[inline]
    pub fn record(&self, latency_nanos: i64) {
        let v = latency_nanos.max(1) as u64;
        self.hist.lock().saturating_record(v);
    }

    /// Log percentiles since the last call, then reset. Quiet when empty.
    pub fn log_and_reset(&self) {
        let mut hist = self.hist.lock();
        if hist.is_empty() {
            return;
        }
        tracing::info!(
            target: "metrics",
            "{} count={} p50={:.1}us p99={:.1}us p999={:.1}us max={:.1}us",
            self.name,
            hist.len(),
            hist.value_at_quantile(0.50) as f64 / 1_000.0,
            hist.value_at_quantile(0.99) as f64 / 1_000.0,
            hist.value_at_quantile(0.999) as f64 / 1_000.0,
            hist.max() as f64 / 1_000.0,
        );
        hist.reset();
    }

    /// Samples recorded since the last reset.
    pub fn count(&self) -> u64 {
        self.hist.lock().len()
    }
}
