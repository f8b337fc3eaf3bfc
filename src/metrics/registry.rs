//! Allocation metrics.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use super::LatencyHistogram;
use crate::codec::Prefix;

/// Counters for everything the allocators do, shared between the facade,
/// the allocators and the HTTP layer.
#[derive(Default)]
pub struct MetricsRegistry {
    pub reservations_total: AtomicU64,
    pub previews_total: AtomicU64,
    pub overrides_total: AtomicU64,
    pub seeded_records_total: AtomicU64,
    pub drift_corrections_total: AtomicU64,
    pub conflict_retries_total: AtomicU64,
    pub reserve_latency_us: LatencyHistogram,
    /// Failed calls keyed by `AllocationError::kind`.
    errors_by_kind: DashMap<&'static str, AtomicU64>,
    /// Successful reservations keyed by prefix.
    reservations_by_prefix: DashMap<Prefix, AtomicU64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reservation(&self, prefix: Prefix, elapsed: Duration) {
        self.reservations_total.fetch_add(1, Ordering::Relaxed);
        self.reserve_latency_us.observe(elapsed);
        self.reservations_by_prefix
            .entry(prefix)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preview(&self) {
        self.previews_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_override(&self) {
        self.overrides_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seed(&self) {
        self.seeded_records_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drift_correction(&self) {
        self.drift_corrections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_retries(&self, retries: u64) {
        if retries > 0 {
            self.conflict_retries_total.fetch_add(retries, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors_by_kind
            .entry(kind)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self, kind: &str) -> u64 {
        self.errors_by_kind
            .get(kind)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reservations_for(&self, prefix: Prefix) -> u64 {
        self.reservations_by_prefix
            .get(&prefix)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Formats all metrics in Prometheus exposition format.
    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        let counters = [
            ("fiscseq_reservations_total", "Successful reservations", &self.reservations_total),
            ("fiscseq_previews_total", "Read-only previews", &self.previews_total),
            ("fiscseq_overrides_total", "Administrative counter overrides", &self.overrides_total),
            ("fiscseq_seeded_records_total", "Counters seeded from document history", &self.seeded_records_total),
            ("fiscseq_drift_corrections_total", "Counters raised to match document history", &self.drift_corrections_total),
            ("fiscseq_conflict_retries_total", "Optimistic write conflicts that were retried", &self.conflict_retries_total),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, counter.load(Ordering::Relaxed));
        }

        let _ = writeln!(output, "# HELP fiscseq_errors_total Failed calls by error kind");
        let _ = writeln!(output, "# TYPE fiscseq_errors_total counter");
        let mut errors: Vec<_> = self
            .errors_by_kind
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort_unstable();
        for (kind, count) in errors {
            let _ = writeln!(output, "fiscseq_errors_total{{kind=\"{}\"}} {}", kind, count);
        }

        let _ = writeln!(output, "# HELP fiscseq_prefix_reservations_total Successful reservations by prefix");
        let _ = writeln!(output, "# TYPE fiscseq_prefix_reservations_total counter");
        let mut prefixes: Vec<_> = self
            .reservations_by_prefix
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        prefixes.sort_unstable();
        for (prefix, count) in prefixes {
            let _ = writeln!(output, "fiscseq_prefix_reservations_total{{prefix=\"{}\"}} {}", prefix, count);
        }

        output.push_str(
            &self
                .reserve_latency_us
                .format_prometheus("fiscseq_reserve_latency_us", "Reservation latency in microseconds"),
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_updates_totals_and_prefix() {
        let m = MetricsRegistry::new();
        let b01 = Prefix::parse("B01").unwrap();
        let b02 = Prefix::parse("B02").unwrap();
        m.record_reservation(b01, Duration::from_micros(400));
        m.record_reservation(b01, Duration::from_micros(600));
        m.record_reservation(b02, Duration::from_micros(100));

        assert_eq!(m.reservations_total.load(Ordering::Relaxed), 3);
        assert_eq!(m.reservations_for(b01), 2);
        assert_eq!(m.reservations_for(b02), 1);
        assert_eq!(m.reserve_latency_us.count(), 3);
    }

    #[test]
    fn errors_are_keyed_by_kind() {
        let m = MetricsRegistry::new();
        m.record_error("lock_timeout");
        m.record_error("lock_timeout");
        m.record_error("sequence_exhausted");
        assert_eq!(m.errors("lock_timeout"), 2);
        assert_eq!(m.errors("sequence_exhausted"), 1);
        assert_eq!(m.errors("collision_detected"), 0);
    }

    #[test]
    fn zero_retries_are_not_counted() {
        let m = MetricsRegistry::new();
        m.record_conflict_retries(0);
        m.record_conflict_retries(3);
        assert_eq!(m.conflict_retries_total.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn prometheus_output_contains_labels() {
        let m = MetricsRegistry::new();
        m.record_reservation(Prefix::parse("E31").unwrap(), Duration::from_millis(2));
        m.record_error("conflict_exhausted");
        let text = m.format_prometheus();
        assert!(text.contains("fiscseq_reservations_total 1"));
        assert!(text.contains("fiscseq_errors_total{kind=\"conflict_exhausted\"} 1"));
        assert!(text.contains("fiscseq_prefix_reservations_total{prefix=\"E31\"} 1"));
        assert!(text.contains("fiscseq_reserve_latency_us_count 1"));
    }
}
