pub mod canonical;
pub mod error;
pub mod identity;
pub mod memory;
pub mod redb_store;
pub mod snapshot;
pub mod store;

pub use canonical::{canonical_json, state_hash};
pub use error::StoreError;
pub use identity::{generate_api_key, DeviceIdentity};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use snapshot::{SaveOutcome, SnapshotKind, StateSnapshot};
pub use store::StateStore;
