use thiserror::Error;

use crate::ids::{ChangeId, ChangeSetId, CommitId, VersionId};

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error raised by plugin code. It is carried unchanged in [`Error::Plugin`].
pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("circular inheritance: version '{parent}' already descends from '{child}'")]
    CircularInheritance { parent: VersionId, child: VersionId },
    #[error("inheritance chain of version '{version}' exceeds {limit} levels")]
    InheritanceDepthExceeded { version: VersionId, limit: usize },
    #[error("unknown change: {0}")]
    UnknownChange(ChangeId),
    #[error("unknown change set: {0}")]
    UnknownChangeSet(ChangeSetId),
    #[error("change set edge {parent} -> {child} would create a cycle")]
    CircularChangeSetEdge {
        parent: ChangeSetId,
        child: ChangeSetId,
    },
    #[error("unknown commit: {0}")]
    UnknownCommit(CommitId),
    #[error("unknown version: {0}")]
    UnknownVersion(String),
    #[error("invalid schema '{key}': {reason}")]
    InvalidSchema { key: String, reason: String },
    #[error("no plugin registered for key '{0}'")]
    PluginNotFound(String),
    #[error("plugin '{0}' does not support applying changes")]
    PluginDoesNotSupportApply(String),
    #[error("plugin '{plugin_key}' failed: {source}")]
    Plugin {
        plugin_key: String,
        #[source]
        source: PluginError,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_schema(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is an integrity violation that leaves the engine usable.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::CircularInheritance { .. }
                | Self::UnknownChange(_)
                | Self::UnknownChangeSet(_)
                | Self::CircularChangeSetEdge { .. }
                | Self::UnknownCommit(_)
                | Self::UnknownVersion(_)
                | Self::InvalidSchema { .. }
                | Self::PluginNotFound(_)
                | Self::PluginDoesNotSupportApply(_)
        )
    }
}
