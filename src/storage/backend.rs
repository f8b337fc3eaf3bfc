//! Allocator selected by configuration.

use std::sync::Arc;

use crate::codec::{FiscalNumber, Prefix};
use crate::contracts::{
    AllocationError, AuditSink, DocumentHistory, DriftReport, EntityId, RecordStore,
    SequenceAllocator, SequenceInfo, StoreError,
};
use crate::metrics::MetricsRegistry;
use crate::storage::{
    LocalAllocator, LocalConfig, LocalStore, RemoteAllocator, RemoteConfig, RetryConfig,
    S3RecordStore,
};

/// Which kind of store holds the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    /// Reads `FISCSEQ_BACKEND` (`local` or `remote`, default: local).
    pub fn from_env() -> Self {
        match std::env::var("FISCSEQ_BACKEND") {
            Ok(v) if v.eq_ignore_ascii_case("remote") => Self::Remote,
            Ok(v) if !v.eq_ignore_ascii_case("local") => {
                tracing::warn!(value = %v, "unknown FISCSEQ_BACKEND, using local");
                Self::Local
            }
            _ => Self::Local,
        }
    }
}

/// Unified allocator supporting the local and remote stores.
pub enum AllocatorBackend {
    /// Exclusive-lock allocator over the local RocksDB store
    Local(LocalAllocator),
    /// Optimistic allocator over S3 conditional writes
    Remote(RemoteAllocator<S3RecordStore>),
}

impl AllocatorBackend {
    /// Builds the backend for `kind` from environment configuration.
    ///
    /// The local store is always needed: it holds the document history
    /// index even when counters live remotely.
    pub async fn from_env(
        kind: BackendKind,
        store: LocalStore,
        history: Arc<dyn DocumentHistory>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, StoreError> {
        match kind {
            BackendKind::Local => {
                let config = LocalConfig::from_env();
                tracing::info!(
                    lock_timeout_ms = config.lock_timeout_ms,
                    allowed_prefixes = config.allowed_prefixes.len(),
                    "using local allocator"
                );
                Ok(Self::Local(
                    LocalAllocator::new(store, history, audit, config).with_metrics(metrics),
                ))
            }
            BackendKind::Remote => {
                let config = RemoteConfig::from_env().ok_or_else(|| {
                    StoreError::S3("FISCSEQ_S3_BUCKET is required for the remote backend".into())
                })?;
                let retry = RetryConfig::from_env();
                tracing::info!(
                    bucket = %config.bucket,
                    base_path = %config.base_path,
                    max_attempts = retry.max_attempts,
                    "using remote allocator"
                );
                let record_store = S3RecordStore::from_config(&config).await;
                Ok(Self::Remote(
                    RemoteAllocator::new(record_store, history, audit, retry).with_metrics(metrics),
                ))
            }
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local(a) => format!("local (lock timeout {}ms)", a.config().lock_timeout_ms),
            Self::Remote(a) => format!(
                "{} (up to {} attempts)",
                a.store().describe(),
                a.retry_config().max_attempts
            ),
        }
    }
}

impl SequenceAllocator for AllocatorBackend {
    async fn reserve(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        match self {
            Self::Local(a) => a.reserve(entity_id, prefix).await,
            Self::Remote(a) => a.reserve(entity_id, prefix).await,
        }
    }

    async fn preview_next(&self, entity_id: EntityId, prefix: Prefix) -> Result<FiscalNumber, AllocationError> {
        match self {
            Self::Local(a) => a.preview_next(entity_id, prefix).await,
            Self::Remote(a) => a.preview_next(entity_id, prefix).await,
        }
    }

    async fn set_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<String>,
    ) -> Result<(), AllocationError> {
        match self {
            Self::Local(a) => a.set_sequence(entity_id, prefix, last_sequence, reason).await,
            Self::Remote(a) => a.set_sequence(entity_id, prefix, last_sequence, reason).await,
        }
    }

    async fn sequence_info(&self, entity_id: EntityId, prefix: Prefix) -> Result<SequenceInfo, AllocationError> {
        match self {
            Self::Local(a) => a.sequence_info(entity_id, prefix).await,
            Self::Remote(a) => a.sequence_info(entity_id, prefix).await,
        }
    }

    async fn reconcile(&self, entity_id: EntityId, prefix: Prefix) -> Result<DriftReport, AllocationError> {
        match self {
            Self::Local(a) => a.reconcile(entity_id, prefix).await,
            Self::Remote(a) => a.reconcile(entity_id, prefix).await,
        }
    }
}
