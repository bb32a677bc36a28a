use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the two persisted snapshots a row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Target,
    Current,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Target => "target",
            SnapshotKind::Current => "current",
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted state row. The table holds at most one row per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub kind: SnapshotKind,
    /// Canonical-JSON serialization of a `DeviceGraph`.
    pub payload: String,
    /// SHA-256 hex digest over `payload`.
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Whether a save actually touched disk. Unchanged payloads are skipped by
/// hash comparison so idempotent polls cost no flash writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Unchanged,
}
