use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocksdb::{
    ErrorKind, Options, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::codec::{FiscalNumber, Prefix, PrefixResolver};
use crate::contracts::{
    AllocationError, AuditEvent, AuditEventType, AuditSink, CodecError, DocumentHistory,
    DriftReport, EntityId, RecordMetadata, SequenceAllocator, SequenceInfo, StoreError,
};
use crate::metrics::MetricsRegistry;
use crate::storage::DriftCorrector;

/// Key prefix for sequence records
pub(crate) const SEQ_PREFIX: &str = "seq";
/// Key prefix for the document history index
pub(crate) const DOC_PREFIX: &str = "doc";
/// Key every allocator transaction locks first; serializes all writers.
pub(crate) const ALLOCATOR_LOCK_KEY: &[u8] = b"lock:allocator";

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Shared handle to the local RocksDB transaction database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<TransactionDB>,
}

impl LocalStore {
    /// Opens or creates the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get() as i32)
            .unwrap_or(4);
        opts.increase_parallelism(parallelism);
        opts.set_wal_dir(path.join("wal"));

        let txn_db_opts = TransactionDBOptions::default();
        let db = TransactionDB::open(&opts, &txn_db_opts, path)
            .map_err(|e| StoreError::RocksDb(e.to_string()))?;

        tracing::info!(path = %path.display(), "opened local sequence store");
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn db(&self) -> &TransactionDB {
        &self.db
    }
}

/// Local allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Bound on acquiring the exclusive allocator lock.
    pub lock_timeout_ms: u64,
    /// Prefixes this store may allocate under.
    pub allowed_prefixes: BTreeSet<Prefix>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            allowed_prefixes: PrefixResolver::known_prefixes().into_iter().collect(),
        }
    }
}

impl LocalConfig {
    /// Creates a LocalConfig from environment variables.
    ///
    /// Environment variables:
    /// - `FISCSEQ_LOCK_TIMEOUT_MS`: Exclusive lock bound (default: 30000)
    /// - `FISCSEQ_ALLOWED_PREFIXES`: Comma-separated whitelist (default: all known)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("FISCSEQ_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&ms: &u64| ms > 0)
        {
            config.lock_timeout_ms = ms;
        }
        if let Ok(list) = std::env::var("FISCSEQ_ALLOWED_PREFIXES") {
            let parsed = parse_prefix_list(&list);
            if parsed.is_empty() {
                tracing::warn!(value = %list, "FISCSEQ_ALLOWED_PREFIXES has no valid prefix, using all known");
            } else {
                config.allowed_prefixes = parsed;
            }
        }
        config
    }

    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn with_allowed_prefixes(mut self, prefixes: impl IntoIterator<Item = Prefix>) -> Self {
        self.allowed_prefixes = prefixes.into_iter().collect();
        self
    }
}

fn parse_prefix_list(list: &str) -> BTreeSet<Prefix> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match Prefix::parse(s) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(entry = s, error = %e, "ignoring allowed prefix entry");
                None
            }
        })
        .collect()
}

/// Durable state of one local counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    /// Highest sequence ever handed out for the key; 0 if none.
    pub last_seq: u64,
    /// Successful reservations through this store.
    pub issued_count: u64,
    pub metadata: RecordMetadata,
    pub updated_at: DateTime<Utc>,
}

impl SequenceRecord {
    fn new(prefix: Prefix, last_seq: u64) -> Self {
        Self {
            last_seq,
            issued_count: 0,
            metadata: RecordMetadata::new(PrefixResolver::label_for(prefix)),
            updated_at: Utc::now(),
        }
    }

    fn last_assigned(&self, prefix: Prefix) -> Option<FiscalNumber> {
        (self.last_seq > 0)
            .then(|| FiscalNumber::new(prefix, self.last_seq).ok())
            .flatten()
    }
}

enum ReserveStep {
    Reserved {
        number: FiscalNumber,
        seeded_from: Option<u64>,
    },
    Collided(FiscalNumber),
}

/// Sets its flag when the awaiting caller goes away.
///
/// The flag is read once, after the candidate is computed and before the
/// commit. A caller dropped after that read still gets its number committed:
/// the sequence stays gapless in the store, but nobody receives that number.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Single-authority allocator over the local store.
///
/// Every mutating call runs in a pessimistic transaction that first takes the
/// store-wide allocator lock, so at most one allocator transaction is open
/// per store at any time.
#[derive(Clone)]
pub struct LocalAllocator {
    store: LocalStore,
    history: Arc<dyn DocumentHistory>,
    drift: DriftCorrector,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsRegistry>,
    config: LocalConfig,
}

impl LocalAllocator {
    pub fn new(
        store: LocalStore,
        history: Arc<dyn DocumentHistory>,
        audit: Arc<dyn AuditSink>,
        config: LocalConfig,
    ) -> Self {
        Self {
            store,
            drift: DriftCorrector::new(Arc::clone(&history)),
            history,
            audit,
            metrics: Arc::new(MetricsRegistry::new()),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn record_key(entity_id: EntityId, prefix: Prefix) -> String {
        format!("{}:{}:{}", SEQ_PREFIX, entity_id, prefix)
    }

    fn map_rocks(&self, e: rocksdb::Error) -> AllocationError {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::Busy => AllocationError::LockTimeout {
                timeout_ms: self.config.lock_timeout_ms,
            },
            _ => AllocationError::Store(StoreError::RocksDb(e.to_string())),
        }
    }

    fn ensure_allowed(&self, prefix: Prefix) -> Result<(), AllocationError> {
        if self.config.allowed_prefixes.contains(&prefix) {
            Ok(())
        } else {
            Err(AllocationError::InvalidCategory {
                category: prefix.to_string(),
            })
        }
    }

    fn begin(&self) -> Transaction<'_, TransactionDB> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(i64::try_from(self.config.lock_timeout_ms).unwrap_or(i64::MAX));
        self.store.db().transaction_opt(&write_opts, &txn_opts)
    }

    /// Opens a transaction holding the store-wide allocator lock.
    fn begin_exclusive(&self) -> Result<Transaction<'_, TransactionDB>, AllocationError> {
        let txn = self.begin();
        txn.get_for_update(ALLOCATOR_LOCK_KEY, true)
            .map_err(|e| self.map_rocks(e))?;
        Ok(txn)
    }

    fn rollback(txn: Transaction<'_, TransactionDB>) {
        if let Err(e) = txn.rollback() {
            tracing::warn!(error = %e, "rollback failed, transaction will be discarded");
        }
    }

    fn load(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        key: &str,
    ) -> Result<Option<SequenceRecord>, AllocationError> {
        match txn.get(key.as_bytes()).map_err(|e| self.map_rocks(e))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string()).into()),
            None => Ok(None),
        }
    }

    fn save(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        key: &str,
        record: &SequenceRecord,
    ) -> Result<(), AllocationError> {
        let bytes = bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        txn.put(key.as_bytes(), bytes).map_err(|e| self.map_rocks(e))
    }

    /// Loads the record, or a fresh one seeded from issued history.
    fn load_or_seed(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        key: &str,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<(SequenceRecord, Option<u64>), AllocationError> {
        match self.load(txn, key)? {
            Some(record) => Ok((record, None)),
            None => {
                let seed = self.history.max_sequence(entity_id, prefix, true)?;
                Ok((SequenceRecord::new(prefix, seed), Some(seed)))
            }
        }
    }

    fn next_number(prefix: Prefix, last_seq: u64) -> Result<FiscalNumber, AllocationError> {
        let capacity = prefix.capacity();
        match last_seq.checked_add(1) {
            Some(next) if next <= capacity => Ok(FiscalNumber::new(prefix, next)?),
            _ => Err(AllocationError::SequenceExhausted { prefix, capacity }),
        }
    }

    fn reserve_in(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<ReserveStep, AllocationError> {
        let key = Self::record_key(entity_id, prefix);
        let (mut record, seeded_from) = self.load_or_seed(txn, &key, entity_id, prefix)?;

        let number = Self::next_number(prefix, record.last_seq)?;
        if self.history.exists(entity_id, &number.to_string(), true)? {
            return Ok(ReserveStep::Collided(number));
        }

        record.last_seq = number.sequence();
        record.issued_count += 1;
        record.updated_at = Utc::now();
        self.save(txn, &key, &record)?;
        Ok(ReserveStep::Reserved { number, seeded_from })
    }

    /// Reserves the next number, blocking the calling thread.
    pub fn reserve_blocking(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<FiscalNumber, AllocationError> {
        self.reserve_checked(entity_id, prefix, None)
    }

    fn reserve_checked(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        abandoned: Option<&AtomicBool>,
    ) -> Result<FiscalNumber, AllocationError> {
        self.ensure_allowed(prefix)?;
        let txn = self.begin_exclusive()?;

        let step = match self.reserve_in(&txn, entity_id, prefix) {
            Ok(step) => step,
            Err(e) => {
                Self::rollback(txn);
                return Err(e);
            }
        };

        match step {
            ReserveStep::Reserved { number, seeded_from } => {
                if abandoned.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                    Self::rollback(txn);
                    tracing::warn!(entity_id, prefix = %prefix, "reservation abandoned by caller, rolled back");
                    return Err(StoreError::Io("reservation abandoned by caller".into()).into());
                }
                txn.commit().map_err(|e| self.map_rocks(e))?;

                if let Some(seed) = seeded_from {
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
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        AuditEventType::Reserved,
                        entity_id,
                        prefix,
                        serde_json::json!({ "number": number.to_string(), "sequence": number.sequence() }),
                    ),
                );
                tracing::debug!(entity_id, prefix = %prefix, number = %number, "reserved");
                Ok(number)
            }
            ReserveStep::Collided(number) => {
                Self::rollback(txn);
                tracing::error!(
                    entity_id,
                    prefix = %prefix,
                    number = %number,
                    "candidate already present in document history"
                );
                let repaired_to = match self.repair_after_collision(entity_id, prefix, number) {
                    Ok(raised) => Some(raised),
                    Err(e) => {
                        tracing::warn!(entity_id, prefix = %prefix, error = %e, "collision repair failed");
                        None
                    }
                };
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        AuditEventType::CollisionDetected,
                        entity_id,
                        prefix,
                        serde_json::json!({ "number": number.to_string(), "repaired_to": repaired_to }),
                    ),
                );
                Err(AllocationError::CollisionDetected {
                    entity_id,
                    number: number.to_string(),
                })
            }
        }
    }

    /// Raises the counter past a colliding candidate. Returns the resulting
    /// `last_seq`; never lowers it and never hands out a number.
    fn repair_after_collision(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        candidate: FiscalNumber,
    ) -> Result<u64, AllocationError> {
        let txn = self.begin_exclusive()?;
        let key = Self::record_key(entity_id, prefix);

        let result = (|| {
            let (mut record, _) = self.load_or_seed(&txn, &key, entity_id, prefix)?;
            let history_max = self.history.max_sequence(entity_id, prefix, true)?;
            let previous = record.last_seq;
            let raised = previous.max(candidate.sequence()).max(history_max);
            if raised > previous {
                record.last_seq = raised;
                record.updated_at = Utc::now();
                self.save(&txn, &key, &record)?;
            }
            Ok::<_, AllocationError>((previous, raised, history_max))
        })();

        match result {
            Ok((previous, raised, history_max)) => {
                txn.commit().map_err(|e| self.map_rocks(e))?;
                if raised > previous {
                    self.metrics.record_drift_correction();
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEvent::new(
                            AuditEventType::DriftCorrected,
                            entity_id,
                            prefix,
                            serde_json::json!({
                                "trigger": "collision",
                                "previous_last": previous,
                                "new_last": raised,
                                "history_max": history_max,
                            }),
                        ),
                    );
                }
                Ok(raised)
            }
            Err(e) => {
                Self::rollback(txn);
                Err(e)
            }
        }
    }

    /// What `reserve` would hand out next. Takes no lock, writes nothing.
    pub fn preview_blocking(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<FiscalNumber, AllocationError> {
        let txn = self.begin();
        let key = Self::record_key(entity_id, prefix);
        let (record, _) = self.load_or_seed(&txn, &key, entity_id, prefix)?;
        Self::next_number(prefix, record.last_seq)
    }

    /// Force-writes the counter so that `last_sequence` was the last number
    /// handed out.
    pub fn set_sequence_blocking(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<&str>,
    ) -> Result<(), AllocationError> {
        self.ensure_allowed(prefix)?;
        let capacity = prefix.capacity();
        if last_sequence > capacity {
            return Err(CodecError::SequenceOutOfRange {
                prefix,
                sequence: last_sequence,
                capacity,
            }
            .into());
        }

        let txn = self.begin_exclusive()?;
        let key = Self::record_key(entity_id, prefix);
        let result = (|| {
            let existing = self.load(&txn, &key)?;
            let previous = existing.as_ref().map(|r| r.last_seq);
            let mut record = existing.unwrap_or_else(|| SequenceRecord::new(prefix, 0));
            record.last_seq = last_sequence;
            record.updated_at = Utc::now();
            if let Some(reason) = reason {
                record.metadata.notes = Some(reason.to_string());
            }
            self.save(&txn, &key, &record)?;
            Ok::<_, AllocationError>(previous)
        })();

        let previous = match result {
            Ok(previous) => previous,
            Err(e) => {
                Self::rollback(txn);
                return Err(e);
            }
        };
        txn.commit().map_err(|e| self.map_rocks(e))?;

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

    pub fn sequence_info_blocking(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<SequenceInfo, AllocationError> {
        let txn = self.begin();
        let key = Self::record_key(entity_id, prefix);
        let (record, _) = self.load_or_seed(&txn, &key, entity_id, prefix)?;
        let next_sequence = record.last_seq.saturating_add(1);
        Ok(SequenceInfo {
            entity_id,
            prefix,
            last_assigned: record.last_assigned(prefix),
            next_sequence,
            next_preview: FiscalNumber::new(prefix, next_sequence).ok(),
            total_issued: record.issued_count,
        })
    }

    /// Audits the stored counter against history and raises it if behind.
    pub fn reconcile_blocking(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<DriftReport, AllocationError> {
        let txn = self.begin_exclusive()?;
        let key = Self::record_key(entity_id, prefix);

        let result = (|| {
            let mut record = self
                .load(&txn, &key)?
                .unwrap_or_else(|| SequenceRecord::new(prefix, 0));
            let last_assigned = record.last_assigned(prefix).map(|n| n.to_string());
            let report = self.drift.audit(
                entity_id,
                prefix,
                last_assigned.as_deref(),
                record.last_seq.saturating_add(1),
            )?;
            if report.safe_next > report.stored_next {
                record.last_seq = report.safe_next - 1;
                record.updated_at = Utc::now();
                self.save(&txn, &key, &record)?;
            }
            Ok::<_, AllocationError>(report)
        })();

        let report = match result {
            Ok(report) if report.drifted() => report,
            Ok(report) => {
                Self::rollback(txn);
                return Ok(report);
            }
            Err(e) => {
                Self::rollback(txn);
                return Err(e);
            }
        };
        txn.commit().map_err(|e| self.map_rocks(e))?;

        tracing::warn!(
            entity_id,
            prefix = %prefix,
            stored_next = report.stored_next,
            safe_next = report.safe_next,
            "local counter raised to match history"
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
        Ok(report)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AllocationError>
where
    F: FnOnce() -> Result<T, AllocationError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(format!("blocking allocator task failed: {}", e)))?
}

impl SequenceAllocator for LocalAllocator {
    async fn reserve(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        let this = self.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));
        run_blocking(move || this.reserve_checked(entity_id, prefix, Some(abandoned.as_ref()))).await
    }

    async fn preview_next(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        let this = self.clone();
        run_blocking(move || this.preview_blocking(entity_id, prefix)).await
    }

    async fn set_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<String>,
    ) -> Result<(), AllocationError> {
        let this = self.clone();
        run_blocking(move || this.set_sequence_blocking(entity_id, prefix, last_sequence, reason.as_deref())).await
    }

    async fn sequence_info(&self, entity_id: EntityId, prefix: Prefix) -> Result<SequenceInfo, AllocationError> {
        let this = self.clone();
        run_blocking(move || this.sequence_info_blocking(entity_id, prefix)).await
    }

    async fn reconcile(&self, entity_id: EntityId, prefix: Prefix) -> Result<DriftReport, AllocationError> {
        let this = self.clone();
        run_blocking(move || this.reconcile_blocking(entity_id, prefix)).await
    }
}
