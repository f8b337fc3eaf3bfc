use std::future::Future;

use serde::Serialize;

use crate::codec::{FiscalNumber, Prefix};
use crate::contracts::error::AllocationError;

/// Identifier of the issuing entity. Each entity owns independent counters
/// per prefix.
pub type EntityId = u64;

/// Reserves gapless fiscal sequence numbers per (entity, prefix).
///
/// # Invariants
/// - Uniqueness: no two successful `reserve` calls for the same key return
///   the same number.
/// - Monotonicity: successive successful reservations for a key embed
///   sequences that increase by exactly one, absent drift repair.
/// - Durability: a number is returned only after its increment committed.
/// - Key isolation: reserving under one prefix never touches another.
pub trait SequenceAllocator: Send + Sync {
    /// Reserves and durably records the next number for the key.
    fn reserve(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> impl Future<Output = Result<FiscalNumber, AllocationError>> + Send;

    /// Returns what `reserve` would hand out next, without mutating state.
    fn preview_next(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> impl Future<Output = Result<FiscalNumber, AllocationError>> + Send;

    /// Force-writes the counter so that `last_sequence` is the last issued
    /// value. Bypasses drift correction. The prior and new values, and the
    /// optional `reason`, are sent to the audit sink.
    fn set_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_sequence: u64,
        reason: Option<String>,
    ) -> impl Future<Output = Result<(), AllocationError>> + Send;

    /// Diagnostic projection of a counter.
    fn sequence_info(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> impl Future<Output = Result<SequenceInfo, AllocationError>> + Send;

    /// Audits the counter against document history and raises it if it is
    /// behind. Never lowers a counter.
    fn reconcile(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> impl Future<Output = Result<DriftReport, AllocationError>> + Send;
}

/// Diagnostic view of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceInfo {
    pub entity_id: EntityId,
    pub prefix: Prefix,
    /// Most recently handed-out number, if any.
    pub last_assigned: Option<FiscalNumber>,
    /// Sequence the stored record points at next.
    pub next_sequence: u64,
    /// What `reserve` would return now; `None` once the prefix is exhausted.
    pub next_preview: Option<FiscalNumber>,
    /// Successful reservations recorded by this store.
    pub total_issued: u64,
}

/// Outcome of comparing a stored counter with document history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub entity_id: EntityId,
    pub prefix: Prefix,
    /// `next_sequence` as stored.
    pub stored_next: u64,
    /// `last_assigned + 1`, when `last_assigned` is present and parseable.
    pub expected_next: Option<u64>,
    /// Highest sequence found in issued-document history.
    pub history_max: u64,
    /// The sequence that is safe to hand out next.
    pub safe_next: u64,
}

impl DriftReport {
    pub fn drifted(&self) -> bool {
        self.safe_next != self.stored_next
    }
}
