//! Staged state writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EntityKey, VersionId};
use crate::schema::{LIX_FILE_ID, OWN_ENTITY_PLUGIN_KEY};

/// A single entity upsert or deletion addressed to one version.
///
/// `version_id = None` means "the active version at flush time". `content = None`
/// stages a deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub version_id: Option<VersionId>,
    pub content: Option<Value>,
}

impl EntityWrite {
    pub fn upsert(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        schema_version: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: schema_version.into(),
            file_id: LIX_FILE_ID.to_string(),
            plugin_key: OWN_ENTITY_PLUGIN_KEY.to_string(),
            version_id: None,
            content: Some(content),
        }
    }

    pub fn delete(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            content: None,
            ..Self::upsert(entity_id, schema_key, schema_version, Value::Null)
        }
    }

    pub fn file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    pub fn plugin(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = plugin_key.into();
        self
    }

    pub fn version(mut self, version_id: impl Into<VersionId>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn is_deletion(&self) -> bool {
        self.content.is_none()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// Tracked writes become changes and commits; untracked writes only touch the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateWrite {
    Tracked(EntityWrite),
    Untracked(EntityWrite),
}

impl StateWrite {
    pub fn entity(&self) -> &EntityWrite {
        match self {
            Self::Tracked(write) | Self::Untracked(write) => write,
        }
    }

    pub fn is_untracked(&self) -> bool {
        matches!(self, Self::Untracked(_))
    }
}
