use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::audit;
use crate::codec::{FiscalNumber, Prefix, PrefixResolver};
use crate::contracts::{
    AllocationError, AuditEvent, AuditEventType, AuditSink, CodecError, DocumentHistory,
    DriftReport, EntityId, RecordMetadata, RecordStore, SequenceAllocator, SequenceDocument,
    SequenceInfo, StoreError, Versioned,
};
use crate::metrics::MetricsRegistry;
use crate::storage::retry::{with_backoff, RetryConfig};
use crate::storage::DriftCorrector;

fn is_conflict(err: &AllocationError) -> bool {
    matches!(err, AllocationError::Store(e) if e.is_conflict())
}

/// Runs a history lookup on the blocking pool; the history index is a
/// synchronous RocksDB scan.
async fn off_runtime<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(format!("blocking history task failed: {}", e)))?
}

/// Outcome of the attempt that won the compare-and-swap.
struct Committed {
    number: FiscalNumber,
    seeded_from: Option<u64>,
    /// Stored `next_sequence` when the drift corrector moved it.
    corrected_from: Option<u64>,
}

/// Multi-authority allocator over an optimistic record store.
///
/// Each attempt loads the counter document, derives a safe next sequence
/// and writes it back conditioned on the loaded version. A lost race is
/// retried from the load with exponential backoff.
pub struct RemoteAllocator<S: RecordStore> {
    store: S,
    history: Arc<dyn DocumentHistory>,
    drift: DriftCorrector,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsRegistry>,
    retry: RetryConfig,
}

impl<S: RecordStore> RemoteAllocator<S> {
    pub fn new(
        store: S,
        history: Arc<dyn DocumentHistory>,
        audit: Arc<dyn AuditSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            drift: DriftCorrector::new(Arc::clone(&history)),
            history,
            audit,
            metrics: Arc::new(MetricsRegistry::new()),
            retry,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn new_document(entity_id: EntityId, prefix: Prefix, next_sequence: u64) -> SequenceDocument {
        let now = Utc::now();
        SequenceDocument {
            entity_id,
            prefix,
            last_assigned: None,
            next_sequence,
            issued_count: 0,
            metadata: RecordMetadata::new(PrefixResolver::label_for(prefix)),
            updated_at: now,
        }
    }

    /// Safe next sequence for a loaded document, or the history seed for an
    /// absent one.
    async fn safe_next(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        loaded: Option<&SequenceDocument>,
    ) -> Result<u64, StoreError> {
        let drift = self.drift.clone();
        let history = Arc::clone(&self.history);
        let recorded = loaded.map(|doc| (doc.last_assigned.clone(), doc.next_sequence));
        let next = off_runtime(move || match recorded {
            Some((last_assigned, next_sequence)) => {
                drift.correct(entity_id, prefix, last_assigned.as_deref(), next_sequence)
            }
            None => Ok(history.max_sequence(entity_id, prefix, true)?.saturating_add(1)),
        })
        .await?;
        Ok(next.max(1))
    }

    fn candidate(prefix: Prefix, next: u64) -> Result<FiscalNumber, AllocationError> {
        let capacity = prefix.capacity();
        if next > capacity {
            return Err(AllocationError::SequenceExhausted { prefix, capacity });
        }
        Ok(FiscalNumber::new(prefix, next)?)
    }

    async fn reserve_attempt(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<Committed, AllocationError> {
        let loaded = self.store.load(entity_id, prefix).await?;
        let next = self.safe_next(entity_id, prefix, loaded.as_ref().map(|v| &v.value)).await?;
        let number = Self::candidate(prefix, next)?;

        let (mut document, expected, seeded_from, corrected_from) = match loaded {
            Some(Versioned { value, version }) => {
                let corrected_from = (value.next_sequence != next).then_some(value.next_sequence);
                (value, Some(version), None, corrected_from)
            }
            None => (Self::new_document(entity_id, prefix, next), None, Some(next - 1), None),
        };

        document.last_assigned = Some(number.to_string());
        document.next_sequence = next.saturating_add(1);
        document.issued_count += 1;
        document.updated_at = Utc::now();
        self.store.store(&document, expected.as_deref()).await?;

        Ok(Committed {
            number,
            seeded_from,
            corrected_from,
        })
    }

    /// Runs `op` under the retry policy, turning exhausted conflicts into
    /// [`AllocationError::ConflictExhausted`].
    async fn retrying<T, F, Fut>(&self, context: &str, mut op: F) -> Result<T, AllocationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AllocationError>>,
    {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let result = with_backoff(
            &self.retry,
            context,
            || {
                counter.fetch_add(1, Ordering::Relaxed);
                op()
            },
            is_conflict,
        )
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        self.metrics
            .record_conflict_retries(attempts.saturating_sub(1) as u64);
        match result {
            Err(AllocationError::Store(StoreError::Conflict(last_conflict))) => {
                tracing::error!(context, attempts, last_conflict = %last_conflict, "optimistic retries exhausted");
                Err(AllocationError::ConflictExhausted {
                    attempts,
                    last_conflict,
                })
            }
            other => other,
        }
    }

    pub async fn reserve_remote(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<FiscalNumber, AllocationError> {
        let context = format!("reserve {}/{}", entity_id, prefix);
        let committed = self
            .retrying(&context, || self.reserve_attempt(entity_id, prefix))
            .await?;

        if let Some(seed) = committed.seeded_from {
            self.metrics.record_seed();
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::new(
                    AuditEventType::RecordSeeded,
                    entity_id,
                    prefix,
                    serde_json::json!({ "seed": seed, "source": "history" }),
                ),
            );
        }
        if let Some(stored_next) = committed.corrected_from {
            self.metrics.record_drift_correction();
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::new(
                    AuditEventType::DriftCorrected,
                    entity_id,
                    prefix,
                    serde_json::json!({
                        "trigger": "reserve",
                        "stored_next": stored_next,
                        "safe_next": committed.number.sequence(),
                    }),
                ),
            );
        }
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::Reserved,
                entity_id,
                prefix,
                serde_json::json!({
                    "number": committed.number.to_string(),
                    "sequence": committed.number.sequence(),
                }),
            ),
        );
        tracing::debug!(entity_id, prefix = %prefix, number = %committed.number, "reserved");
        Ok(committed.number)
    }

    async fn set_sequence_attempt(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<&str>,
    ) -> Result<Option<u64>, AllocationError> {
        let loaded = self.store.load(entity_id, prefix).await?;
        let (mut document, expected) = match loaded {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (Self::new_document(entity_id, prefix, 1), None),
        };
        let previous = expected
            .is_some()
            .then(|| document.next_sequence.saturating_sub(1));

        document.last_assigned = if last_sequence > 0 {
            Some(FiscalNumber::new(prefix, last_sequence)?.to_string())
        } else {
            None
        };
        document.next_sequence = last_sequence.saturating_add(1);
        document.updated_at = Utc::now();
        if let Some(reason) = reason {
            document.metadata.notes = Some(reason.to_string());
        }
        self.store.store(&document, expected.as_deref()).await?;
        Ok(previous)
    }

    pub async fn set_sequence_remote(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<&str>,
    ) -> Result<(), AllocationError> {
        let capacity = prefix.capacity();
        if last_sequence > capacity {
            return Err(CodecError::SequenceOutOfRange {
                prefix,
                sequence: last_sequence,
                capacity,
            }
            .into());
        }

        let context = format!("set_sequence {}/{}", entity_id, prefix);
        let previous = self
            .retrying(&context, || {
                self.set_sequence_attempt(entity_id, prefix, last_sequence, reason)
            })
            .await?;

        if previous.is_some_and(|p| p > last_sequence) {
            tracing::warn!(
                entity_id,
                prefix = %prefix,
                previous = ?previous,
                new = last_sequence,
                "sequence override lowered the counter"
            );
        }
        self.metrics.record_override();
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::SequenceOverridden,
                entity_id,
                prefix,
                serde_json::json!({ "previous": previous, "new": last_sequence, "reason": reason }),
            ),
        );
        Ok(())
    }

    pub async fn preview_remote(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<FiscalNumber, AllocationError> {
        let loaded = self.store.load(entity_id, prefix).await?;
        let next = self.safe_next(entity_id, prefix, loaded.as_ref().map(|v| &v.value)).await?;
        Self::candidate(prefix, next)
    }

    pub async fn sequence_info_remote(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<SequenceInfo, AllocationError> {
        let loaded = self.store.load(entity_id, prefix).await?;
        let safe_next = self.safe_next(entity_id, prefix, loaded.as_ref().map(|v| &v.value)).await?;
        let info = match loaded {
            Some(Versioned { value, .. }) => SequenceInfo {
                entity_id,
                prefix,
                last_assigned: value.last_assigned.as_deref().and_then(|n| n.parse().ok()),
                next_sequence: value.next_sequence,
                next_preview: FiscalNumber::new(prefix, safe_next).ok(),
                total_issued: value.issued_count,
            },
            None => SequenceInfo {
                entity_id,
                prefix,
                last_assigned: FiscalNumber::new(prefix, safe_next - 1)
                    .ok()
                    .filter(|n| n.sequence() > 0),
                next_sequence: safe_next,
                next_preview: FiscalNumber::new(prefix, safe_next).ok(),
                total_issued: 0,
            },
        };
        Ok(info)
    }

    async fn reconcile_attempt(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<DriftReport, AllocationError> {
        let loaded = self.store.load(entity_id, prefix).await?;
        let (mut document, expected) = match loaded {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (Self::new_document(entity_id, prefix, 1), None),
        };
        let drift = self.drift.clone();
        let last_assigned = document.last_assigned.clone();
        let next_sequence = document.next_sequence;
        let report = off_runtime(move || {
            drift.audit(entity_id, prefix, last_assigned.as_deref(), next_sequence)
        })
        .await?;
        if report.drifted() {
            document.next_sequence = report.safe_next;
            document.updated_at = Utc::now();
            self.store.store(&document, expected.as_deref()).await?;
        }
        Ok(report)
    }

    pub async fn reconcile_remote(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<DriftReport, AllocationError> {
        let context = format!("reconcile {}/{}", entity_id, prefix);
        let report = self
            .retrying(&context, || self.reconcile_attempt(entity_id, prefix))
            .await?;

        if report.drifted() {
            tracing::warn!(
                entity_id,
                prefix = %prefix,
                stored_next = report.stored_next,
                safe_next = report.safe_next,
                "remote counter raised to match history"
            );
            self.metrics.record_drift_correction();
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::new(
                    AuditEventType::DriftCorrected,
                    entity_id,
                    prefix,
                    serde_json::json!({
                        "trigger": "reconcile",
                        "stored_next": report.stored_next,
                        "safe_next": report.safe_next,
                        "history_max": report.history_max,
                    }),
                ),
            );
        }
        Ok(report)
    }
}

impl<S: RecordStore> SequenceAllocator for RemoteAllocator<S> {
    async fn reserve(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        self.reserve_remote(entity_id, prefix).await
    }

    async fn preview_next(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        self.preview_remote(entity_id, prefix).await
    }

    async fn set_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<String>,
    ) -> Result<(), AllocationError> {
        self.set_sequence_remote(entity_id, prefix, last_sequence, reason.as_deref())
            .await
    }

    async fn sequence_info(&self, entity_id: EntityId, prefix: Prefix) -> Result<SequenceInfo, AllocationError> {
        self.sequence_info_remote(entity_id, prefix).await
    }

    async fn reconcile(&self, entity_id: EntityId, prefix: Prefix) -> Result<DriftReport, AllocationError> {
        self.reconcile_remote(entity_id, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::storage::{InMemoryHistory, InMemoryRecordStore};

    fn p(s: &str) -> Prefix {
        Prefix::parse(s).unwrap()
    }

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: false,
        }
    }

    struct Fixture {
        allocator: RemoteAllocator<InMemoryRecordStore>,
        history: Arc<InMemoryHistory>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture(max_attempts: usize) -> Fixture {
        let history = InMemoryHistory::shared();
        let sink = Arc::new(MemoryAuditSink::new());
        let allocator = RemoteAllocator::new(
            InMemoryRecordStore::new(),
            history.clone(),
            sink.clone(),
            fast_retry(max_attempts),
        );
        Fixture {
            allocator,
            history,
            sink,
        }
    }

    fn stored(f: &Fixture, entity_id: EntityId, prefix: Prefix) -> SequenceDocument {
        f.allocator.store().get(entity_id, prefix).unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_reservation_seeds_from_history() {
        let f = fixture(5);
        f.history.record_issued(3, "B0100000099").unwrap();
        let number = f.allocator.reserve(3, p("B01")).await.unwrap();
        assert_eq!(number.to_string(), "B0100000100");

        let doc = stored(&f, 3, p("B01"));
        assert_eq!(doc.last_assigned.as_deref(), Some("B0100000100"));
        assert_eq!(doc.next_sequence, 101);
        assert_eq!(doc.issued_count, 1);
        assert_eq!(f.sink.events()[0].event_type, AuditEventType::RecordSeeded);
    }

    #[tokio::test]
    async fn sequential_reservations_are_gapless() {
        let f = fixture(5);
        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(f.allocator.reserve(1, p("E31")).await.unwrap().sequence());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(stored(&f, 1, p("E31")).next_sequence, 5);
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let f = fixture(5);
        f.allocator.reserve(1, p("B01")).await.unwrap();
        f.allocator.store().inject_conflicts(3);
        let number = f.allocator.reserve(1, p("B01")).await.unwrap();
        assert_eq!(number.sequence(), 2);
        assert_eq!(f.allocator.metrics.conflict_retries_total.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_name_last_conflict() {
        let f = fixture(3);
        f.allocator.store().inject_conflicts(10);
        let err = f.allocator.reserve(1, p("B01")).await.unwrap_err();
        match &err {
            AllocationError::ConflictExhausted {
                attempts,
                last_conflict,
            } => {
                assert_eq!(*attempts, 3);
                assert!(last_conflict.contains("injected"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        assert!(f.allocator.store().get(1, p("B01")).unwrap().is_none());
    }

    #[tokio::test]
    async fn drifted_record_is_corrected_on_reserve() {
        let f = fixture(5);
        let mut doc = RemoteAllocator::<InMemoryRecordStore>::new_document(1, p("B01"), 160);
        doc.last_assigned = Some("B0100000163".into());
        f.allocator.store().put_unchecked(doc).unwrap();

        assert_eq!(f.allocator.reserve(1, p("B01")).await.unwrap().sequence(), 164);
        assert_eq!(f.allocator.reserve(1, p("B01")).await.unwrap().sequence(), 165);
        assert!(f
            .sink
            .events()
            .iter()
            .any(|e| e.event_type == AuditEventType::DriftCorrected));
    }

    #[tokio::test]
    async fn drift_correction_respects_history() {
        let f = fixture(5);
        f.history.record_issued(1, "B0100000170").unwrap();
        let mut doc = RemoteAllocator::<InMemoryRecordStore>::new_document(1, p("B01"), 160);
        doc.last_assigned = Some("B0100000163".into());
        f.allocator.store().put_unchecked(doc).unwrap();

        assert_eq!(f.allocator.reserve(1, p("B01")).await.unwrap().sequence(), 171);
    }

    #[tokio::test]
    async fn exhaustion_is_not_retried() {
        let f = fixture(5);
        f.allocator.set_sequence(1, p("B01"), 99_999_999, None).await.unwrap();
        let writes = f.allocator.store().writes();
        let err = f.allocator.reserve(1, p("B01")).await.unwrap_err();
        assert!(matches!(err, AllocationError::SequenceExhausted { .. }));
        assert_eq!(f.allocator.store().writes(), writes);
    }

    #[tokio::test]
    async fn set_sequence_overrides_and_audits() {
        let f = fixture(5);
        f.allocator.reserve(1, p("B02")).await.unwrap();
        f.allocator
            .set_sequence(1, p("B02"), 40, Some("manual gap".into()))
            .await
            .unwrap();
        assert_eq!(f.allocator.reserve(1, p("B02")).await.unwrap().sequence(), 41);

        let event = f
            .sink
            .events()
            .into_iter()
            .find(|e| e.event_type == AuditEventType::SequenceOverridden)
            .unwrap();
        assert_eq!(event.payload["previous"], 1);
        assert_eq!(event.payload["new"], 40);
    }

    #[tokio::test]
    async fn set_sequence_above_capacity_is_rejected() {
        let f = fixture(5);
        let err = f
            .allocator
            .set_sequence(1, p("B01"), 100_000_000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::MalformedNumber(_)));
    }

    #[tokio::test]
    async fn preview_and_info_do_not_write() {
        let f = fixture(5);
        f.history.record_issued(1, "B0100000009").unwrap();
        assert_eq!(f.allocator.preview_next(1, p("B01")).await.unwrap().sequence(), 10);

        let info = f.allocator.sequence_info(1, p("B01")).await.unwrap();
        assert_eq!(info.last_assigned.unwrap().sequence(), 9);
        assert_eq!(info.next_sequence, 10);
        assert_eq!(info.total_issued, 0);
        assert_eq!(f.allocator.store().writes(), 0);
    }

    #[tokio::test]
    async fn sequence_info_after_reservations() {
        let f = fixture(5);
        for _ in 0..2 {
            f.allocator.reserve(5, p("B14")).await.unwrap();
        }
        let info = f.allocator.sequence_info(5, p("B14")).await.unwrap();
        assert_eq!(info.last_assigned.unwrap().to_string(), "B1400000002");
        assert_eq!(info.next_sequence, 3);
        assert_eq!(info.next_preview.unwrap().sequence(), 3);
        assert_eq!(info.total_issued, 2);
    }

    #[tokio::test]
    async fn reconcile_raises_behind_counter() {
        let f = fixture(5);
        f.allocator.reserve(1, p("B01")).await.unwrap();
        f.history.record_issued(1, "B0100000050").unwrap();

        let report = f.allocator.reconcile(1, p("B01")).await.unwrap();
        assert!(report.drifted());
        assert_eq!(report.safe_next, 51);
        assert_eq!(stored(&f, 1, p("B01")).next_sequence, 51);
    }

    #[tokio::test]
    async fn reconcile_of_healthy_counter_writes_nothing() {
        let f = fixture(5);
        f.allocator.reserve(1, p("B01")).await.unwrap();
        let writes = f.allocator.store().writes();
        let report = f.allocator.reconcile(1, p("B01")).await.unwrap();
        assert!(!report.drifted());
        assert_eq!(f.allocator.store().writes(), writes);
    }
}
