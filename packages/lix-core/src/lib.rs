#![forbid(unsafe_code)]
//! Core of the Lix state engine: the change log model, commit and change-set
//! graphs, version inheritance, stored schemas and the entity view compiler.
//! Nothing here touches a database; `lix-sqlite` supplies the storage.

pub mod change;
pub mod config;
pub mod error;
pub mod graph;
pub mod ids;
pub mod inheritance;
pub mod materialization;
pub mod plugin;
pub mod schema;
pub mod traits;
pub mod view;
pub mod write;

pub use change::{snapshot_id_for, Change, ChangeWithContent, Snapshot};
pub use config::LixConfig;
pub use error::{Error, PluginError, Result};
pub use graph::{
    is_ancestor_or_self, pick_leaf_changes, walk_ancestors, AncestorEntry, ChangeSet,
    ChangeSetElement, CommitRecord, LeafCandidate, Version,
};
pub use ids::{
    ChangeId, ChangeSetId, CommitId, EntityKey, SnapshotId, VersionId, GLOBAL_VERSION_ID,
    PENDING_SENTINEL, UNTRACKED_SENTINEL,
};
pub use inheritance::{resolve, try_resolve, InheritanceGraph, Resolved, Tombstoned};
pub use materialization::{
    apply_write, resolve_row, CacheRow, CacheStore, CacheWrite, JournalEntry, JournalEvent,
    MemoryCache, RowLayer,
};
pub use plugin::{ApplyChanges, DetectedChange, FileContext, Plugin, PluginRegistry, SchemaRef};
pub use schema::{StoredSchema, LIX_FILE_ID, OWN_ENTITY_PLUGIN_KEY};
pub use traits::{Clock, DeterministicClock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
pub use view::{EntityViewPlan, ViewVariant};
pub use write::{EntityWrite, StateWrite};
