use serde::{Deserialize, Serialize};

use crate::codec::Prefix;
use crate::contracts::error::StoreError;
use crate::contracts::EntityId;

/// Read access to issued-document history, owned by the document subsystem.
///
/// This is the ground truth used to seed counters and to detect drift.
pub trait DocumentHistory: Send + Sync {
    /// Returns the highest sequence embedded in a fiscal number of this
    /// entity that starts with `prefix` and has the prefix class's length.
    /// With `issued_only`, documents that were received rather than emitted
    /// are ignored. Returns 0 if nothing matches.
    fn max_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        issued_only: bool,
    ) -> Result<u64, StoreError>;

    /// Returns true if a document of this entity carries `number`. With
    /// `issued_only`, only documents the entity emitted count.
    fn exists(&self, entity_id: EntityId, number: &str, issued_only: bool) -> Result<bool, StoreError>;
}

/// A persisted document as seen by the history index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedDocument {
    pub entity_id: EntityId,
    pub fiscal_number: String,
    /// Free-text category as recorded by the document subsystem.
    pub category: Option<String>,
    /// True if the entity emitted this document (false for received ones).
    pub issued: bool,
    /// Tax id of the supplier that emitted a received document.
    pub issuer: Option<String>,
}

impl IssuedDocument {
    /// A document the entity emitted itself.
    pub fn emitted(entity_id: EntityId, fiscal_number: &str) -> Self {
        Self {
            entity_id,
            fiscal_number: fiscal_number.to_string(),
            category: None,
            issued: true,
            issuer: None,
        }
    }

    /// A document received from the supplier `issuer`.
    pub fn received(entity_id: EntityId, fiscal_number: &str, issuer: &str) -> Self {
        Self {
            entity_id,
            fiscal_number: fiscal_number.to_string(),
            category: None,
            issued: false,
            issuer: Some(issuer.to_string()),
        }
    }
}
