use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::ids::{ChangeId, EntityKey, SnapshotId};

const SNAPSHOT_DOMAIN: &[u8] = b"lix/snapshot/v0";

/// Immutable content blob referenced by changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub content: Value,
}

impl Snapshot {
    /// Build a snapshot whose id is the content hash of `content`.
    pub fn from_content(content: Value) -> Result<Self> {
        let id = snapshot_id_for(&content)?;
        Ok(Self { id, content })
    }
}

/// Content hash of the canonical JSON encoding.
///
/// `serde_json::Map` keeps keys sorted, so equal documents hash equally
/// regardless of the key order they were written in.
pub fn snapshot_id_for(content: &Value) -> Result<SnapshotId> {
    let encoded = serde_json::to_vec(content)?;
    let mut hasher = Hasher::new();
    hasher.update(SNAPSHOT_DOMAIN);
    hasher.update(&encoded);
    Ok(SnapshotId(hasher.finalize().to_hex().to_string()))
}

/// Immutable change log entry. `snapshot_id = None` records a deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_id: Option<SnapshotId>,
    pub created_at: String,
}

impl Change {
    pub fn is_deletion(&self) -> bool {
        self.snapshot_id.is_none()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// A change joined with its snapshot content, as handed to plugins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeWithContent {
    pub change: Change,
    pub content: Option<Value>,
}

impl ChangeWithContent {
    pub fn key(&self) -> EntityKey {
        self.change.key()
    }
}
