use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::codec::Prefix;

/// Failures surfaced by a reservation or administrative call.
///
/// Every variant is produced only after the enclosing transaction has been
/// rolled back or aborted, so no partially-applied counter is ever observable.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("document category '{category}' is not enabled for this store")]
    InvalidCategory { category: String },

    #[error("exclusive allocator lock not acquired within {timeout_ms}ms")]
    LockTimeout { timeout_ms: u64 },

    #[error("gave up after {attempts} conflicting attempts, last conflict: {last_conflict}")]
    ConflictExhausted {
        attempts: usize,
        last_conflict: String,
    },

    #[error("sequence space for prefix {prefix} is exhausted (capacity {capacity})")]
    SequenceExhausted { prefix: Prefix, capacity: u64 },

    #[error("fiscal number {number} already exists in document history for entity {entity_id}")]
    CollisionDetected { entity_id: u64, number: String },

    #[error("malformed fiscal number: {0}")]
    MalformedNumber(#[from] CodecError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AllocationError {
    /// Returns true if the caller may retry the same call and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::CollisionDetected { .. } | Self::ConflictExhausted { .. }
        )
    }

    /// Short machine-readable label, used for metrics and API error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCategory { .. } => "invalid_category",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::ConflictExhausted { .. } => "conflict_exhausted",
            Self::SequenceExhausted { .. } => "sequence_exhausted",
            Self::CollisionDetected { .. } => "collision_detected",
            Self::MalformedNumber(_) => "malformed_number",
            Self::Store(_) => "store_error",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("'{0}' does not match the standard or electronic shape")]
    Malformed(String),

    #[error("'{0}' is not a valid prefix (expected letter + 2 digits)")]
    InvalidPrefix(String),

    #[error("sequence {sequence} exceeds capacity {capacity} for prefix {prefix}")]
    SequenceOutOfRange {
        prefix: Prefix,
        sequence: u64,
        capacity: u64,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Error, Debug)]
#[error("audit sink failed: {0}")]
pub struct AuditError(pub String);

/// Extension trait for converting lock errors to StoreError.
pub trait LockResultExt<T> {
    /// Converts a lock error to a StoreError.
    fn map_lock_err(self) -> Result<T, StoreError>;
}

impl<'a, T> LockResultExt<MutexGuard<'a, T>>
    for Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<MutexGuard<'a, T>, StoreError> {
        self.map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl<'a, T> LockResultExt<RwLockReadGuard<'a, T>>
    for Result<RwLockReadGuard<'a, T>, PoisonError<RwLockReadGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<RwLockReadGuard<'a, T>, StoreError> {
        self.map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl<'a, T> LockResultExt<RwLockWriteGuard<'a, T>>
    for Result<RwLockWriteGuard<'a, T>, PoisonError<RwLockWriteGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<RwLockWriteGuard<'a, T>, StoreError> {
        self.map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}
