use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use vigil_domain::DeviceGraph;

use crate::canonical::{canonical_json, state_hash};
use crate::error::StoreError;
use crate::identity::DeviceIdentity;
use crate::snapshot::{SaveOutcome, SnapshotKind, StateSnapshot};
use crate::store::StateStore;

#[derive(Debug, Default)]
struct Inner {
    identity: Option<DeviceIdentity>,
    snapshots: HashMap<SnapshotKind, StateSnapshot>,
}

/// In-memory implementation of [`StateStore`].
///
/// All data is lost on process exit. Suitable for tests; `write_count`
/// makes the bounded-write invariant assertable.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshot writes that actually happened (hash-skipped saves
    /// are not counted).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        Ok(self.inner.read().await.identity.clone())
    }

    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.inner.write().await.identity = Some(identity.clone());
        Ok(())
    }

    async fn mark_provisioned(&self, uuid: &str) -> Result<DeviceIdentity, StoreError> {
        let mut guard = self.inner.write().await;
        let identity = guard
            .identity
            .as_mut()
            .filter(|id| id.uuid == uuid)
            .ok_or(StoreError::IdentityNotFound)?;
        identity.provisioned = true;
        identity.provisioning_api_key = None;
        identity.registered_at = Some(Utc::now());
        Ok(identity.clone())
    }

    async fn clear_identity(&self) -> Result<(), StoreError> {
        self.inner.write().await.identity = None;
        Ok(())
    }

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError> {
        Ok(self.inner.read().await.snapshots.get(&kind).cloned())
    }

    async fn save_snapshot(
        &self,
        kind: SnapshotKind,
        graph: &DeviceGraph,
    ) -> Result<SaveOutcome, StoreError> {
        let hash = state_hash(graph);
        let mut guard = self.inner.write().await;
        if guard.snapshots.get(&kind).map(|s| s.hash.as_str()) == Some(hash.as_str()) {
            return Ok(SaveOutcome::Unchanged);
        }
        guard.snapshots.insert(
            kind,
            StateSnapshot {
                kind,
                payload: canonical_json(graph),
                hash,
                updated_at: Utc::now(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(SaveOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_domain::{App, AppId};

    fn graph_with_app(id: i64) -> DeviceGraph {
        let mut graph = DeviceGraph::default();
        graph.apps.insert(
            AppId(id),
            App { app_id: AppId(id), app_name: format!("app-{}", id), services: vec![] },
        );
        graph
    }

    #[tokio::test]
    async fn identical_saves_write_once() {
        let store = MemoryStore::new();
        let graph = graph_with_app(1);
        for _ in 0..100 {
            store.save_snapshot(SnapshotKind::Target, &graph).await.unwrap();
        }
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn changed_graph_writes_again() {
        let store = MemoryStore::new();
        assert_eq!(
            store.save_snapshot(SnapshotKind::Target, &graph_with_app(1)).await.unwrap(),
            SaveOutcome::Written
        );
        assert_eq!(
            store.save_snapshot(SnapshotKind::Target, &graph_with_app(2)).await.unwrap(),
            SaveOutcome::Written
        );
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let store = MemoryStore::new();
        let graph = graph_with_app(7);
        store.save_snapshot(SnapshotKind::Current, &graph).await.unwrap();
        let snap = store.load_snapshot(SnapshotKind::Current).await.unwrap().unwrap();
        let back: DeviceGraph = serde_json::from_str(&snap.payload).unwrap();
        assert_eq!(back, graph);
        assert_eq!(snap.hash, state_hash(&graph));
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let store = MemoryStore::new();
        store.save_snapshot(SnapshotKind::Target, &graph_with_app(1)).await.unwrap();
        assert!(store.load_snapshot(SnapshotKind::Current).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_provisioned_drops_fleet_key() {
        let store = MemoryStore::new();
        let identity = DeviceIdentity::generate(Some("fleet".into()));
        store.save_identity(&identity).await.unwrap();

        let updated = store.mark_provisioned(&identity.uuid).await.unwrap();
        assert!(updated.provisioned);
        assert!(updated.provisioning_api_key.is_none());

        let loaded = store.load_identity().await.unwrap().unwrap();
        assert!(loaded.provisioned);
        assert!(loaded.provisioning_api_key.is_none());
    }

    #[tokio::test]
    async fn mark_provisioned_unknown_uuid_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.mark_provisioned("nope").await,
            Err(StoreError::IdentityNotFound)
        ));
    }
}
