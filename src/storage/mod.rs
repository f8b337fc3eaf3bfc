mod backend;
mod drift;
mod history;
mod local;
mod memory;
mod remote;
pub mod retry;
mod s3;

pub use backend::{AllocatorBackend, BackendKind};
pub use drift::{conservative_next, DriftCorrector};
pub use history::{InMemoryHistory, RocksDbHistory};
pub use local::{LocalAllocator, LocalConfig, LocalStore, SequenceRecord, DEFAULT_LOCK_TIMEOUT_MS};
pub use memory::InMemoryRecordStore;
pub use remote::RemoteAllocator;
pub use retry::{with_backoff, RetryConfig};
pub use s3::{RemoteConfig, S3RecordStore};
