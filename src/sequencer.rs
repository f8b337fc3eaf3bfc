//! Entry point for collaborators that need fiscal numbers.
//!
//! [`Sequencer`] resolves categories to prefixes, delegates to the configured
//! allocator and records metrics. The codec functions are re-exported for
//! callers that only display or edit numbers.

use std::sync::Arc;
use std::time::Instant;

use crate::codec::{FiscalNumber, Prefix, PrefixResolver};
use crate::contracts::{AllocationError, DriftReport, EntityId, SequenceAllocator, SequenceInfo};
use crate::metrics::MetricsRegistry;

pub use crate::codec::{capacity_for, format, padding_for, parse, validate};

pub struct Sequencer<A: SequenceAllocator> {
    allocator: A,
    resolver: PrefixResolver,
    metrics: Arc<MetricsRegistry>,
}

impl<A: SequenceAllocator> Sequencer<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            resolver: PrefixResolver::default(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: PrefixResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn resolver(&self) -> &PrefixResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Reserves the next number for a category label or a literal prefix.
    ///
    /// A well-formed prefix (`"B02"`, `"e31"`) is used as-is; anything else
    /// goes through the category table and falls back to the default prefix.
    pub async fn reserve(
        &self,
        entity_id: EntityId,
        category_or_prefix: &str,
    ) -> Result<FiscalNumber, AllocationError> {
        let explicit = Prefix::parse(category_or_prefix).is_ok().then_some(category_or_prefix);
        self.reserve_with(entity_id, category_or_prefix, explicit).await
    }

    /// Reserves with a category and an optional explicit prefix that wins
    /// when at least three characters long.
    pub async fn reserve_with(
        &self,
        entity_id: EntityId,
        category: &str,
        explicit_prefix: Option<&str>,
    ) -> Result<FiscalNumber, AllocationError> {
        let prefix = self.resolver.resolve(category, explicit_prefix);
        let started = Instant::now();
        match self.allocator.reserve(entity_id, prefix).await {
            Ok(number) => {
                self.metrics.record_reservation(prefix, started.elapsed());
                tracing::info!(entity_id, prefix = %prefix, number = %number, "fiscal number reserved");
                Ok(number)
            }
            Err(e) => Err(self.failed("reserve", entity_id, prefix, e)),
        }
    }

    pub async fn preview_next(&self, entity_id: EntityId, prefix: &str) -> Result<FiscalNumber, AllocationError> {
        let prefix = Prefix::parse(prefix)?;
        self.metrics.record_preview();
        self.allocator
            .preview_next(entity_id, prefix)
            .await
            .map_err(|e| self.failed("preview_next", entity_id, prefix, e))
    }

    /// Administrative override. The prefix must be well-formed: an override
    /// never lands on the default prefix by accident.
    pub async fn set_sequence(
        &self,
        entity_id: EntityId,
        prefix: &str,
        last_sequence: u64,
        reason: Option<String>,
    ) -> Result<(), AllocationError> {
        let prefix = Prefix::parse(prefix)?;
        tracing::info!(entity_id, prefix = %prefix, last_sequence, "overriding sequence");
        self.allocator
            .set_sequence(entity_id, prefix, last_sequence, reason)
            .await
            .map_err(|e| self.failed("set_sequence", entity_id, prefix, e))
    }

    pub async fn sequence_info(&self, entity_id: EntityId, prefix: &str) -> Result<SequenceInfo, AllocationError> {
        let prefix = Prefix::parse(prefix)?;
        self.allocator
            .sequence_info(entity_id, prefix)
            .await
            .map_err(|e| self.failed("sequence_info", entity_id, prefix, e))
    }

    pub async fn reconcile(&self, entity_id: EntityId, prefix: &str) -> Result<DriftReport, AllocationError> {
        let prefix = Prefix::parse(prefix)?;
        self.allocator
            .reconcile(entity_id, prefix)
            .await
            .map_err(|e| self.failed("reconcile", entity_id, prefix, e))
    }

    fn failed(&self, op: &'static str, entity_id: EntityId, prefix: Prefix, e: AllocationError) -> AllocationError {
        self.metrics.record_error(e.kind());
        tracing::warn!(op, entity_id, prefix = %prefix, kind = e.kind(), error = %e, "allocation call failed");
        e
    }
}
