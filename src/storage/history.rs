use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use rocksdb::{IteratorMode, ReadOptions};

use crate::codec::{self, Prefix};
use crate::contracts::{DocumentHistory, EntityId, IssuedDocument, LockResultExt, StoreError};
use crate::storage::local::{LocalStore, DOC_PREFIX};

/// Sequence embedded in `number` if it belongs to `prefix`'s space: it must
/// start with the prefix, have the class length and parse.
pub(crate) fn matching_sequence(number: &str, prefix: Prefix) -> Option<u64> {
    let prefix_text = prefix.to_string();
    if !number.starts_with(&prefix_text) || number.len() != prefix.number_len() {
        return None;
    }
    codec::parse(number).ok().map(|(_, seq)| seq)
}

/// Marker closing the key of an emitted document.
const EMITTED: &str = "e";
/// Marker opening the key of a received document; followed by the issuer.
const RECEIVED: &str = "r";

fn normalize(number: &str) -> String {
    number.trim().to_ascii_uppercase()
}

/// Document history index kept in the local RocksDB store.
///
/// Emitted documents are keyed `doc:{entity}:{fiscal_number}:e` and received
/// ones `doc:{entity}:{fiscal_number}:r:{issuer}`, so all numbers of one
/// prefix are contiguous, sorted by sequence, and a supplier document never
/// replaces one the entity emitted.
#[derive(Clone)]
pub struct RocksDbHistory {
    store: LocalStore,
}

impl RocksDbHistory {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    fn number_key(entity_id: EntityId, number: &str) -> String {
        format!("{}:{}:{}", DOC_PREFIX, entity_id, number)
    }

    fn doc_key(document: &IssuedDocument) -> String {
        let number_key = Self::number_key(document.entity_id, &normalize(&document.fiscal_number));
        if document.issued {
            format!("{}:{}", number_key, EMITTED)
        } else {
            let issuer = document.issuer.as_deref().unwrap_or_default().trim();
            format!("{}:{}:{}", number_key, RECEIVED, issuer)
        }
    }

    /// Records a persisted document. Called by the document subsystem.
    pub fn record_document(&self, document: &IssuedDocument) -> Result<(), StoreError> {
        let key = Self::doc_key(document);
        let bytes = bincode::serialize(document).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .db()
            .put(key.as_bytes(), bytes)
            .map_err(|e| StoreError::RocksDb(e.to_string()))
    }

    /// Convenience for recording an emitted document.
    pub fn record_issued(&self, entity_id: EntityId, fiscal_number: &str) -> Result<(), StoreError> {
        self.record_document(&IssuedDocument::emitted(entity_id, fiscal_number))
    }

    fn any_key_under(&self, key_prefix: String) -> Result<bool, StoreError> {
        let mut upper = key_prefix.clone().into_bytes();
        if let Some(last) = upper.last_mut() {
            *last += 1;
        }
        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(key_prefix.into_bytes());
        opts.set_iterate_upper_bound(upper);
        match self.store.db().iterator_opt(IteratorMode::Start, opts).next() {
            Some(item) => item.map(|_| true).map_err(|e| StoreError::RocksDb(e.to_string())),
            None => Ok(false),
        }
    }
}

impl DocumentHistory for RocksDbHistory {
    fn max_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        issued_only: bool,
    ) -> Result<u64, StoreError> {
        let scan_prefix = format!("{}:{}:{}", DOC_PREFIX, entity_id, prefix);
        // ';' sorts right after the digits, bounding the scan to this prefix.
        let upper = format!("{};", scan_prefix);

        let mut opts = ReadOptions::default();
        opts.set_iterate_lower_bound(scan_prefix.as_bytes().to_vec());
        opts.set_iterate_upper_bound(upper.as_bytes().to_vec());

        // Numbers are fixed-width within a class, so the first match walking
        // backwards is the maximum.
        let iter = self.store.db().iterator_opt(IteratorMode::End, opts);
        let number_offset = format!("{}:{}:", DOC_PREFIX, entity_id).len();

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::RocksDb(e.to_string()))?;
            let key = String::from_utf8_lossy(&key);
            let Some((number, kind)) = key.get(number_offset..).and_then(|rest| rest.split_once(':')) else {
                continue;
            };
            if issued_only && kind != EMITTED {
                continue;
            }
            if let Some(sequence) = matching_sequence(number, prefix) {
                return Ok(sequence);
            }
        }
        Ok(0)
    }

    fn exists(&self, entity_id: EntityId, number: &str, issued_only: bool) -> Result<bool, StoreError> {
        let number_key = Self::number_key(entity_id, &normalize(number));
        let emitted = self
            .store
            .db()
            .get(format!("{}:{}", number_key, EMITTED).as_bytes())
            .map_err(|e| StoreError::RocksDb(e.to_string()))?
            .is_some();
        if emitted || issued_only {
            return Ok(emitted);
        }
        self.any_key_under(format!("{}:{}:", number_key, RECEIVED))
    }
}

/// Emitted documents by number, received ones by (number, issuer).
#[derive(Debug, Default)]
struct EntityDocuments {
    emitted: BTreeMap<String, IssuedDocument>,
    received: BTreeMap<(String, String), IssuedDocument>,
}

/// In-memory document history.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    documents: RwLock<HashMap<EntityId, EntityDocuments>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record_document(&self, document: IssuedDocument) -> Result<(), StoreError> {
        let number = normalize(&document.fiscal_number);
        let mut documents = self.documents.write().map_lock_err()?;
        let entity = documents.entry(document.entity_id).or_default();
        if document.issued {
            entity.emitted.insert(number, document);
        } else {
            let issuer = document.issuer.as_deref().unwrap_or_default().trim().to_string();
            entity.received.insert((number, issuer), document);
        }
        Ok(())
    }

    pub fn record_issued(&self, entity_id: EntityId, fiscal_number: &str) -> Result<(), StoreError> {
        self.record_document(IssuedDocument::emitted(entity_id, fiscal_number))
    }
}

impl DocumentHistory for InMemoryHistory {
    fn max_sequence(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
        issued_only: bool,
    ) -> Result<u64, StoreError> {
        let documents = self.documents.read().map_lock_err()?;
        let Some(entity) = documents.get(&entity_id) else {
            return Ok(0);
        };
        let emitted = entity.emitted.keys();
        let received = entity
            .received
            .keys()
            .filter(|_| !issued_only)
            .map(|(number, _)| number);
        let max = emitted
            .chain(received)
            .filter_map(|number| matching_sequence(number, prefix))
            .max();
        Ok(max.unwrap_or(0))
    }

    fn exists(&self, entity_id: EntityId, number: &str, issued_only: bool) -> Result<bool, StoreError> {
        let number = normalize(number);
        let documents = self.documents.read().map_lock_err()?;
        Ok(documents.get(&entity_id).is_some_and(|entity| {
            entity.emitted.contains_key(&number)
                || (!issued_only && entity.received.keys().any(|(n, _)| *n == number))
        }))
    }
}
