use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::codec::Prefix;
use crate::contracts::{
    EntityId, LockResultExt, RecordStore, SequenceDocument, StoreError, Versioned,
};

/// In-memory record store with compare-and-swap semantics.
///
/// Conflicts can be injected to simulate writers racing on another host:
/// the next `n` stores fail with [`StoreError::Conflict`] as if another
/// writer had committed first.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    documents: Mutex<HashMap<(EntityId, Prefix), Versioned<SequenceDocument>>>,
    next_version: AtomicU64,
    injected_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` store calls fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrites a document without a version check.
    pub fn put_unchecked(&self, document: SequenceDocument) -> Result<(), StoreError> {
        let version = self.bump_version();
        self.documents.lock().map_lock_err()?.insert(
            (document.entity_id, document.prefix),
            Versioned {
                value: document,
                version,
            },
        );
        Ok(())
    }

    pub fn get(&self, entity_id: EntityId, prefix: Prefix) -> Result<Option<SequenceDocument>, StoreError> {
        Ok(self
            .documents
            .lock()
            .map_lock_err()?
            .get(&(entity_id, prefix))
            .map(|v| v.value.clone()))
    }

    fn bump_version(&self) -> String {
        format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordStore for InMemoryRecordStore {
    async fn load(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<Option<Versioned<SequenceDocument>>, StoreError> {
        Ok(self
            .documents
            .lock()
            .map_lock_err()?
            .get(&(entity_id, prefix))
            .cloned())
    }

    async fn store(
        &self,
        document: &SequenceDocument,
        expected: Option<&str>,
    ) -> Result<String, StoreError> {
        let key = (document.entity_id, document.prefix);
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict(format!(
                "{}/{}: injected concurrent write",
                key.0, key.1
            )));
        }

        let mut documents = self.documents.lock().map_lock_err()?;
        let current = documents.get(&key).map(|v| v.version.as_str());
        if current != expected {
            return Err(StoreError::Conflict(format!(
                "{}/{}: expected version {:?}, found {:?}",
                key.0, key.1, expected, current
            )));
        }

        let version = self.bump_version();
        documents.insert(
            key,
            Versioned {
                value: document.clone(),
                version: version.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
