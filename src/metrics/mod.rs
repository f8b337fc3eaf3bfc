//! Observability metrics for the allocators.
//!
//! All counters are lock-free atomics so that recording never contends with
//! the allocation path.

pub mod histogram;
pub mod registry;

pub use histogram::LatencyHistogram;
pub use registry::MetricsRegistry;
