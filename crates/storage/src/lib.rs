pub mod conformance;
mod error;
mod jsonl;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use jsonl::JsonlStorage;
pub use memory::{InMemoryStorage, MemoryTransaction};
pub use record::{EventRecord, SnapshotRecord};
pub use traits::LifecycleStorage;
