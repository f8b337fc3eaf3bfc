//! Lock-free latency histogram with Prometheus exposition.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket upper bounds in microseconds.
/// Local reservations sit in the low milliseconds (fsync on commit); remote
/// reservations with backoff can take seconds.
pub const LATENCY_BUCKETS_US: [u64; 12] = [
    100,       // 100μs
    250,       // 250μs
    500,       // 500μs
    1_000,     // 1ms
    2_500,     // 2.5ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    100_000,   // 100ms
    250_000,   // 250ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Cumulative-bucket histogram.
///
/// # Example
///
/// ```
/// use fiscseq::metrics::LatencyHistogram;
///
/// let histogram = LatencyHistogram::new();
/// histogram.observe_us(1_200);
///
/// assert_eq!(histogram.count(), 1);
/// assert_eq!(histogram.sum_us(), 1_200);
/// ```
pub struct LatencyHistogram {
    sum_us: AtomicU64,
    count: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_US.len()],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn observe_us(&self, value_us: u64) {
        self.sum_us.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in LATENCY_BUCKETS_US.iter().zip(&self.buckets) {
            if value_us <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        self.observe_us(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Cumulative bucket counts, aligned with [`LATENCY_BUCKETS_US`].
    pub fn bucket_counts(&self) -> [u64; LATENCY_BUCKETS_US.len()] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    pub fn format_prometheus(&self, name: &str, help: &str) -> String {
        let mut output = String::with_capacity(1024);
        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} histogram", name);
        for (bound, count) in LATENCY_BUCKETS_US.iter().zip(self.bucket_counts()) {
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, bound, count);
        }
        let count = self.count();
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(output, "{}_sum {}", name, self.sum_us());
        let _ = writeln!(output, "{}_count {}", name, count);
        output
    }
}
