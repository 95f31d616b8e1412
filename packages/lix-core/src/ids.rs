use std::fmt;

use serde::{Deserialize, Serialize};

/// Id of the root version every inheritance chain ends in.
pub const GLOBAL_VERSION_ID: &str = "global";

/// `change_id`/`commit_id` written for cache rows produced by untracked writes.
pub const UNTRACKED_SENTINEL: &str = "untracked";

/// `change_id`/`commit_id` reported for writes still sitting in the transaction buffer.
pub const PENDING_SENTINEL: &str = "pending";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of an immutable change log entry.
    ChangeId
);
string_id!(
    /// Identifier of a commit node in the commit DAG.
    CommitId
);
string_id!(
    /// Identifier of a change set.
    ChangeSetId
);
string_id!(
    /// Identifier of a version (branch).
    VersionId
);
string_id!(
    /// Content hash identifying a snapshot.
    SnapshotId
);

impl VersionId {
    pub fn global() -> Self {
        Self(GLOBAL_VERSION_ID.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_VERSION_ID
    }
}

/// Identity of an entity across the change log: one causal sequence of changes per key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.schema_key, self.file_id, self.entity_id)
    }
}
