use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Prefix;
use crate::contracts::error::StoreError;
use crate::contracts::EntityId;

/// A multi-writer document store with optimistic concurrency.
///
/// Every load returns an opaque version token. A store succeeds only if the
/// document is still at that version (or still absent, for `None`);
/// otherwise it fails with [`StoreError::Conflict`] and writes nothing.
pub trait RecordStore: Send + Sync {
    fn load(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> impl Future<Output = Result<Option<Versioned<SequenceDocument>>, StoreError>> + Send;

    /// Writes `document` if the stored version still equals `expected`.
    /// Returns the new version token.
    fn store(
        &self,
        document: &SequenceDocument,
        expected: Option<&str>,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Returns a short description of the backend for diagnostics.
    fn describe(&self) -> String;
}

/// A loaded value together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: String,
}

/// Counter document kept in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDocument {
    pub entity_id: EntityId,
    pub prefix: Prefix,
    /// Last number handed out, as formatted text.
    pub last_assigned: Option<String>,
    /// Sequence the allocator intends to hand out next.
    pub next_sequence: u64,
    pub issued_count: u64,
    pub metadata: RecordMetadata,
    pub updated_at: DateTime<Utc>,
}

/// Descriptive fields carried by both local and remote counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl RecordMetadata {
    pub fn new(category: Option<&str>) -> Self {
        Self {
            category: category.map(String::from),
            created_at: Utc::now(),
            notes: None,
        }
    }
}
