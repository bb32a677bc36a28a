use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use vigil_domain::DeviceGraph;

use crate::canonical::{canonical_json, state_hash};
use crate::error::StoreError;
use crate::identity::DeviceIdentity;
use crate::snapshot::{SaveOutcome, SnapshotKind, StateSnapshot};
use crate::store::StateStore;

const IDENTITY: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("state_snapshot");

/// Persistent state store backed by a redb database file.
///
/// The snapshot table holds one row per kind, written
/// delete-then-insert inside a single transaction, and skipped entirely when
/// the canonical hash is unchanged. Flash writes track real state changes,
/// not poll traffic.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    /// Last written hash per kind; consulted before any disk write.
    hash_cache: Arc<Mutex<HashMap<SnapshotKind, String>>>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically. The hash cache is
    /// seeded from whatever snapshots are already on disk.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let db = Database::create(path)
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.open_table(IDENTITY).map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.open_table(SNAPSHOTS).map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        }

        let store = Self { db: Arc::new(db), hash_cache: Arc::new(Mutex::new(HashMap::new())) };
        store.seed_hash_cache()?;
        Ok(store)
    }

    fn seed_hash_cache(&self) -> Result<(), StoreError> {
        let rtxn = self.db.begin_read().map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn.open_table(SNAPSHOTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut cache = self.hash_cache.lock().unwrap();
        for kind in [SnapshotKind::Target, SnapshotKind::Current] {
            if let Some(guard) = table
                .get(kind.as_str())
                .map_err(|e| StoreError::Internal(e.to_string()))?
            {
                let snap: StateSnapshot = serde_json::from_slice(guard.value())?;
                cache.insert(kind, snap.hash);
            }
        }
        Ok(())
    }

    fn read_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let rtxn = self.db.begin_read().map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn.open_table(IDENTITY).map_err(|e| StoreError::Internal(e.to_string()))?;
        // Single-device store: at most one identity row.
        let mut iter = table.iter().map_err(|e| StoreError::Internal(e.to_string()))?;
        let result = match iter.next() {
            Some(entry) => {
                let (_k, v) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
                Ok(Some(serde_json::from_slice(v.value())?))
            }
            None => Ok(None),
        };
        result
    }

    fn write_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(identity)?;
        let wtxn = self.db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table =
                wtxn.open_table(IDENTITY).map_err(|e| StoreError::Internal(e.to_string()))?;
            table
                .insert(identity.uuid.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedbStore {
    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        self.read_identity()
    }

    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.write_identity(identity)
    }

    async fn mark_provisioned(&self, uuid: &str) -> Result<DeviceIdentity, StoreError> {
        let mut identity = self
            .read_identity()?
            .filter(|id| id.uuid == uuid)
            .ok_or(StoreError::IdentityNotFound)?;
        identity.provisioned = true;
        identity.provisioning_api_key = None;
        identity.registered_at = Some(Utc::now());
        // Single insert overwrites the row, so the flag flip and the key
        // deletion land in the same transaction.
        self.write_identity(&identity)?;
        Ok(identity)
    }

    async fn clear_identity(&self) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table =
                wtxn.open_table(IDENTITY).map_err(|e| StoreError::Internal(e.to_string()))?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
                    let (k, _v) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
                    keys.push(k.value().to_string());
                }
                keys
            };
            for key in keys {
                table.remove(key.as_str()).map_err(|e| StoreError::Internal(e.to_string()))?;
            }
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError> {
        let rtxn = self.db.begin_read().map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn.open_table(SNAPSHOTS).map_err(|e| StoreError::Internal(e.to_string()))?;
        match table.get(kind.as_str()).map_err(|e| StoreError::Internal(e.to_string()))? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(
        &self,
        kind: SnapshotKind,
        graph: &DeviceGraph,
    ) -> Result<SaveOutcome, StoreError> {
        let hash = state_hash(graph);
        {
            let cache = self.hash_cache.lock().unwrap();
            if cache.get(&kind).map(String::as_str) == Some(hash.as_str()) {
                return Ok(SaveOutcome::Unchanged);
            }
        }

        let snapshot = StateSnapshot {
            kind,
            payload: canonical_json(graph),
            hash: hash.clone(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let wtxn = self.db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table =
                wtxn.open_table(SNAPSHOTS).map_err(|e| StoreError::Internal(e.to_string()))?;
            // Delete-then-insert keeps the row count bounded at one per kind.
            table.remove(kind.as_str()).map_err(|e| StoreError::Internal(e.to_string()))?;
            table
                .insert(kind.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;

        self.hash_cache.lock().unwrap().insert(kind, hash);
        Ok(SaveOutcome::Written)
    }
}
