use async_trait::async_trait;
use vigil_domain::DeviceGraph;

use crate::error::StoreError;
use crate::identity::DeviceIdentity;
use crate::snapshot::{SaveOutcome, SnapshotKind, StateSnapshot};

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // ── Identity ──────────────────────────────────────────────────────────────

    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError>;

    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;

    /// Flip `provisioned = true` and delete the provisioning key in one
    /// write transaction.
    async fn mark_provisioned(&self, uuid: &str) -> Result<DeviceIdentity, StoreError>;

    async fn clear_identity(&self) -> Result<(), StoreError>;

    // ── State snapshots ───────────────────────────────────────────────────────

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError>;

    /// Persist a snapshot, skipping the write entirely when the canonical
    /// hash matches the last saved one for this kind.
    async fn save_snapshot(
        &self,
        kind: SnapshotKind,
        graph: &DeviceGraph,
    ) -> Result<SaveOutcome, StoreError>;
}
