//! Drift detection between a stored counter and document history.

use std::sync::Arc;

use crate::codec::{self, Prefix};
use crate::contracts::{DocumentHistory, DriftReport, EntityId, StoreError};

/// The smallest next sequence that cannot collide with history, the stored
/// pointer or the last handed-out number.
pub fn conservative_next(history_max: u64, next_sequence: u64, expected_next: Option<u64>) -> u64 {
    history_max
        .saturating_add(1)
        .max(next_sequence)
        .max(expected_next.unwrap_or(0))
}

/// `last_assigned + 1`, or `None` when `last_assigned` does not parse.
fn expected_from(last_assigned: &str) -> Option<u64> {
    codec::parse(last_assigned)
        .ok()
        .map(|(_, seq)| seq.saturating_add(1))
}

/// Resolves stale or corrupted counters conservatively.
#[derive(Clone)]
pub struct DriftCorrector {
    history: Arc<dyn DocumentHistory>,
}

impl DriftCorrector {
    pub fn new(history: Arc<dyn DocumentHistory>) -> Self {
        Self { history }
    }

    /// Returns the sequence that is safe to hand out next.
    ///
    /// History is only consulted when the record is inconsistent: a
    /// `last_assigned` that is absent (cold start) or that is immediately
    /// followed by `next_sequence` is trusted as-is.
    pub fn correct(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_assigned: Option<&str>,
        next_sequence: u64,
    ) -> Result<u64, StoreError> {
        let Some(last) = last_assigned.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(next_sequence);
        };
        let expected = expected_from(last);
        if expected == Some(next_sequence) {
            return Ok(next_sequence);
        }

        let history_max = self.history.max_sequence(entity_id, prefix, true)?;
        let safe = conservative_next(history_max, next_sequence, expected);
        tracing::warn!(
            entity_id,
            prefix = %prefix,
            last_assigned = last,
            next_sequence,
            history_max,
            safe_next = safe,
            "sequence drift detected"
        );
        Ok(safe)
    }

    /// Compares the record with history unconditionally.
    pub fn audit(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        last_assigned: Option<&str>,
        next_sequence: u64,
    ) -> Result<DriftReport, StoreError> {
        let expected_next = last_assigned
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(expected_from);
        let history_max = self.history.max_sequence(entity_id, prefix, true)?;
        Ok(DriftReport {
            entity_id,
            prefix,
            stored_next: next_sequence,
            expected_next,
            history_max,
            safe_next: conservative_next(history_max, next_sequence, expected_next),
        })
    }
}
