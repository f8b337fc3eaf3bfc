pub mod audit;
pub mod error;
pub mod history;
pub mod record_store;
pub mod sequence;

pub use audit::{AuditEvent, AuditEventType, AuditSink};
pub use error::{AllocationError, AuditError, CodecError, LockResultExt, StoreError};
pub use history::{DocumentHistory, IssuedDocument};
pub use record_store::{RecordMetadata, RecordStore, SequenceDocument, Versioned};
pub use sequence::{DriftReport, EntityId, SequenceAllocator, SequenceInfo};
