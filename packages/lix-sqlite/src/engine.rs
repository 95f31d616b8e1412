//! Engine handle and transactions.
//!
//! Every mutation runs inside one SQLite transaction. Writes are staged in the
//! transaction buffer and committed by the commit protocol when the transaction
//! finishes; if anything fails, the storage transaction rolls back and the handle's
//! in-memory state is restored.

use std::path::Path;
use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, Params};
use serde_json::{Map, Number, Value};
use tracing::{debug, info, warn};

use lix_core::schema::{builtin_schemas, STORED_SCHEMA_KEY, STORED_SCHEMA_VERSION};
use lix_core::{
    resolve_row, AncestorEntry, CacheRow, CacheStore, Change, ChangeId, ChangeSet,
    ChangeSetElement, ChangeSetId, ChangeWithContent, Clock, CommitId, CommitRecord,
    DeterministicClock, EntityKey, EntityWrite, Error, FileContext, IdGenerator,
    InheritanceGraph, JournalEvent, LixConfig, Plugin, PluginRegistry, Result, RowLayer,
    SequentialIds, StateWrite, StoredSchema, SystemClock, UuidGenerator, Version, VersionId,
};

use crate::cache::{self, SqliteCache};
use crate::catalog::{self, SchemaCatalog};
use crate::commit::{self, CommitSummary};
use crate::observer::{ObserverId, Observers};
use crate::schema::{
    self, get_meta, set_meta, storage_err, META_CACHE_STALE, META_CLOCK_TICKS, META_ID_SEQ,
};
use crate::{buffer, change_log, files, graph, journal, version};

/// Parent a new version inherits from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InheritsFrom {
    #[default]
    Global,
    Version(VersionId),
    /// A root version; it sees only its own rows.
    None,
}

/// Options for [`Transaction::create_version`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateVersion {
    pub id: Option<VersionId>,
    pub name: Option<String>,
    /// Version whose tip and rows the new version starts from. Defaults to the active one.
    pub from: Option<VersionId>,
    pub inherits_from: InheritsFrom,
}

impl CreateVersion {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<VersionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn from(mut self, version: impl Into<VersionId>) -> Self {
        self.from = Some(version.into());
        self
    }

    pub fn inherits_from(mut self, parent: impl Into<VersionId>) -> Self {
        self.inherits_from = InheritsFrom::Version(parent.into());
        self
    }

    pub fn without_inheritance(mut self) -> Self {
        self.inherits_from = InheritsFrom::None;
        self
    }
}

struct EngineState {
    config: LixConfig,
    active_version: VersionId,
    clock: Box<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    plugins: PluginRegistry,
    catalog: SchemaCatalog,
    observers: Observers,
}

impl EngineState {
    fn max_depth(&self) -> usize {
        self.config.max_inheritance_depth
    }

    fn persist_positions(&self, conn: &Connection) -> Result<()> {
        if let Some(ticks) = self.clock.snapshot_state() {
            set_meta(conn, META_CLOCK_TICKS, &ticks.to_string())?;
        }
        if let Some(next) = self.ids.snapshot_state() {
            set_meta(conn, META_ID_SEQ, &next.to_string())?;
        }
        Ok(())
    }

    fn positions(&self) -> (Option<i64>, Option<u64>) {
        (self.clock.snapshot_state(), self.ids.snapshot_state())
    }

    fn restore_positions(&mut self, (ticks, next): (Option<i64>, Option<u64>)) {
        if let Some(ticks) = ticks {
            self.clock.restore_state(ticks);
        }
        if let Some(next) = next {
            self.ids.restore_state(next);
        }
    }

    fn sync_catalog(&mut self, conn: &Connection) -> Result<()> {
        if self.catalog.is_stale() {
            self.catalog.reload(conn)?;
            catalog::sync_views(conn, &self.catalog)?;
        }
        Ok(())
    }
}

/// A Lix database: change log, versions, state cache and generated views.
pub struct Lix {
    conn: Connection,
    state: EngineState,
}

impl Lix {
    pub fn open_in_memory(config: LixConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn, config, false)
    }

    pub fn open(path: impl AsRef<Path>, config: LixConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::from_connection(conn, config, true)
    }

    fn from_connection(mut conn: Connection, config: LixConfig, file_backed: bool) -> Result<Self> {
        conn.set_prepared_statement_cache_capacity(64);
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_err)?;
        if file_backed && config.wal {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(storage_err)?;
            debug!(mode = %mode, "journal mode");
        }

        let tx = conn.transaction().map_err(storage_err)?;
        schema::ensure_schema(&tx)?;
        schema::set_ancestry_depth(&tx, config.max_inheritance_depth)?;
        let (clock, ids): (Box<dyn Clock>, Box<dyn IdGenerator>) = if config.deterministic {
            let ticks = get_meta(&tx, META_CLOCK_TICKS)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let next = get_meta(&tx, META_ID_SEQ)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            (
                Box::new(DeterministicClock::resume(ticks)),
                Box::new(SequentialIds::resume(next)),
            )
        } else {
            (Box::new(SystemClock), Box::new(UuidGenerator))
        };
        let mut state = EngineState {
            config,
            active_version: VersionId::global(),
            clock,
            ids,
            plugins: PluginRegistry::new(),
            catalog: SchemaCatalog::new(),
            observers: Observers::default(),
        };

        bootstrap(&tx, &mut state)?;
        state.active_version = version::load_active(&tx)?
            .ok_or_else(|| Error::InconsistentState("no active version".into()))?;
        for schema in builtin_schemas() {
            cache::ensure_cache_table(&tx, &schema.key, &schema.version)?;
        }
        let stale = get_meta(&tx, META_CACHE_STALE)?.as_deref() == Some("1");
        if stale {
            warn!("state cache marked stale, rebuilding");
        }
        if stale || state.config.rebuild_on_open {
            commit::rebuild(&tx, state.max_depth())?;
        }
        state.sync_catalog(&tx)?;
        state.persist_positions(&tx)?;
        tx.commit().map_err(storage_err)?;

        info!(active = %state.active_version, "opened lix");
        Ok(Self { conn, state })
    }

    /// Run `f` in one storage transaction. Staged writes are committed when `f`
    /// succeeds; on any error nothing is persisted and the handle is restored.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let saved_active = self.state.active_version.clone();
        let saved_positions = self.state.positions();
        let tx = self.conn.transaction().map_err(storage_err)?;
        let mut handle = Transaction {
            tx,
            state: &mut self.state,
            summaries: Vec::new(),
        };
        let outcome = match f(&mut handle) {
            Ok(value) => handle.finish().map(|summaries| (value, summaries)),
            Err(err) => {
                drop(handle);
                Err(err)
            }
        };
        match outcome {
            Ok((value, summaries)) => {
                self.state.observers.notify(&summaries);
                Ok(value)
            }
            Err(err) => {
                self.state.active_version = saved_active;
                self.state.restore_positions(saved_positions);
                self.state.catalog.invalidate();
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    pub fn config(&self) -> &LixConfig {
        &self.state.config
    }

    pub fn active_version(&self) -> &VersionId {
        &self.state.active_version
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.state.plugins.register(plugin)
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.state.plugins
    }

    /// Register a callback fired after every transaction that produced commits.
    pub fn on_commit(
        &mut self,
        callback: impl FnMut(&[CommitSummary]) + Send + 'static,
    ) -> ObserverId {
        self.state.observers.add(Box::new(callback))
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.state.observers.remove(id)
    }

    // Writes.

    pub fn write(&mut self, write: StateWrite) -> Result<Vec<CommitSummary>> {
        self.transaction(|tx| {
            tx.stage(write)?;
            tx.flush()
        })
    }

    pub fn write_all(&mut self, writes: Vec<StateWrite>) -> Result<Vec<CommitSummary>> {
        self.transaction(|tx| {
            for write in writes {
                tx.stage(write)?;
            }
            tx.flush()
        })
    }

    /// Execute SQL (including writes through `state`, `state_all` and entity views)
    /// and commit whatever it staged.
    pub fn execute<P: Params>(&mut self, sql: &str, params: P) -> Result<usize> {
        self.transaction(|tx| tx.execute(sql, params))
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.transaction(|tx| tx.execute_batch(sql))
    }

    pub fn query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Map<String, Value>>> {
        query_rows(&self.conn, sql, params)
    }

    /// Effective row of one entity in `version` (the active version when `None`).
    pub fn get_state(&self, key: &EntityKey, version: Option<&VersionId>) -> Result<Option<CacheRow>> {
        let version = version.unwrap_or(&self.state.active_version);
        read_state(&self.conn, self.state.max_depth(), key, version)
    }

    // Versions.

    pub fn create_version(&mut self, options: CreateVersion) -> Result<Version> {
        self.transaction(|tx| tx.create_version(options))
    }

    pub fn add_inheritance(&mut self, parent: &VersionId, child: &VersionId) -> Result<()> {
        self.transaction(|tx| tx.add_inheritance(parent, child))
    }

    pub fn remove_inheritance(&mut self, parent: &VersionId, child: &VersionId) -> Result<()> {
        self.transaction(|tx| tx.remove_inheritance(parent, child))
    }

    pub fn delete_version(&mut self, id: &VersionId) -> Result<()> {
        self.transaction(|tx| tx.delete_version(id))
    }

    pub fn switch_active_version(&mut self, id: &VersionId) -> Result<()> {
        self.transaction(|tx| tx.switch_active_version(id))
    }

    pub fn version(&self, id: &VersionId) -> Result<Version> {
        version::require_version(&self.conn, id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Version> {
        version::load_version_by_name(&self.conn, name)?
            .ok_or_else(|| Error::UnknownVersion(name.to_string()))
    }

    pub fn versions(&self) -> Result<Vec<Version>> {
        version::list_versions(&self.conn)
    }

    /// Versions from `id` itself to its root.
    pub fn resolve_effective_version_chain(&self, id: &VersionId) -> Result<Vec<VersionId>> {
        version::require_version(&self.conn, id)?;
        version::load_inheritance(&self.conn, self.state.max_depth())?.chain(id)
    }

    // Change log and graphs.

    pub fn append_change(&mut self, write: EntityWrite) -> Result<Change> {
        self.transaction(|tx| tx.append_change(write))
    }

    pub fn latest_change(
        &self,
        key: &EntityKey,
        upto: Option<&CommitId>,
    ) -> Result<Option<ChangeWithContent>> {
        change_log::latest_change(&self.conn, key, upto)
    }

    pub fn history_of(&self, key: &EntityKey) -> Result<Vec<ChangeWithContent>> {
        change_log::history_of(&self.conn, key)
    }

    pub fn change(&self, id: &ChangeId) -> Result<ChangeWithContent> {
        change_log::load_change(&self.conn, id)?.ok_or_else(|| Error::UnknownChange(id.clone()))
    }

    pub fn create_change_set(
        &mut self,
        elements: Vec<ChangeSetElement>,
        parents: Vec<ChangeSetId>,
    ) -> Result<ChangeSet> {
        self.transaction(|tx| tx.create_change_set(elements, parents))
    }

    pub fn add_change_set_edge(&mut self, parent: &ChangeSetId, child: &ChangeSetId) -> Result<()> {
        self.transaction(|tx| graph::add_change_set_edge(&tx.tx, parent, child))
    }

    pub fn change_set(&self, id: &ChangeSetId) -> Result<ChangeSet> {
        graph::load_change_set(&self.conn, id)
    }

    pub fn create_commit(
        &mut self,
        change_set_id: &ChangeSetId,
        parents: Vec<CommitId>,
    ) -> Result<CommitRecord> {
        self.transaction(|tx| tx.create_commit(change_set_id, parents))
    }

    pub fn commit_change_set(
        &mut self,
        change_set_id: &ChangeSetId,
        version: Option<&VersionId>,
    ) -> Result<CommitRecord> {
        self.transaction(|tx| tx.commit_change_set(change_set_id, version))
    }

    pub fn commit(&self, id: &CommitId) -> Result<CommitRecord> {
        graph::load_commit(&self.conn, id)
    }

    /// Breadth-first ancestors of a commit; `max_depth` falls back to the configured bound.
    pub fn ancestors_of(&self, id: &CommitId, max_depth: Option<usize>) -> Result<Vec<AncestorEntry>> {
        graph::ancestors_of(
            &self.conn,
            id,
            max_depth.or(self.state.config.history_max_depth),
        )
    }

    // Files.

    pub fn write_file(&mut self, id: &str, path: &str, data: &[u8]) -> Result<Vec<CommitSummary>> {
        self.transaction(|tx| {
            tx.write_file(id, path, data, None)?;
            tx.flush()
        })
    }

    pub fn delete_file(&mut self, id: &str) -> Result<Vec<CommitSummary>> {
        self.transaction(|tx| {
            tx.delete_file(id, None)?;
            tx.flush()
        })
    }

    pub fn read_file(&self, id: &str, version: Option<&VersionId>) -> Result<Option<Vec<u8>>> {
        let version = version.unwrap_or(&self.state.active_version);
        let inheritance = version::load_inheritance(&self.conn, self.state.max_depth())?;
        files::read_file(&self.conn, &inheritance, id, version)
    }

    pub fn apply_change_set(
        &mut self,
        change_set_id: &ChangeSetId,
        version: Option<&VersionId>,
    ) -> Result<Vec<String>> {
        self.transaction(|tx| tx.apply_change_set(change_set_id, version))
    }

    // Schemas.

    pub fn register_schema(&mut self, definition: Value) -> Result<StoredSchema> {
        self.transaction(|tx| tx.register_schema(definition))
    }

    pub fn stored_schema(&mut self, key: &str) -> Result<Option<StoredSchema>> {
        self.state.sync_catalog(&self.conn)?;
        Ok(self.state.catalog.get(key).cloned())
    }

    pub fn stored_schemas(&mut self) -> Result<Vec<StoredSchema>> {
        self.state.sync_catalog(&self.conn)?;
        Ok(self.state.catalog.schemas().cloned().collect())
    }

    // Cache maintenance.

    pub fn rebuild_state_cache(&mut self) -> Result<()> {
        self.transaction(|tx| commit::rebuild(&tx.tx, tx.state.max_depth()))
    }

    /// Force a full rebuild the next time the database is opened.
    pub fn mark_state_cache_stale(&mut self) -> Result<()> {
        self.transaction(|tx| set_meta(&tx.tx, META_CACHE_STALE, "1"))
    }

    /// Every cache row, ordered by schema, entity, file, version and layer.
    pub fn dump_state_cache(&self) -> Result<Vec<CacheRow>> {
        cache::dump(&self.conn)
    }

    pub fn change_count(&self) -> Result<i64> {
        change_log::count_changes(&self.conn)
    }

    pub fn commit_count(&self) -> Result<i64> {
        graph::count_commits(&self.conn)
    }
}

/// Open transaction on a [`Lix`] handle.
pub struct Transaction<'a> {
    tx: rusqlite::Transaction<'a>,
    state: &'a mut EngineState,
    summaries: Vec<CommitSummary>,
}

impl Transaction<'_> {
    fn finish(mut self) -> Result<Vec<CommitSummary>> {
        self.flush()?;
        self.state.persist_positions(&self.tx)?;
        let Self { tx, summaries, .. } = self;
        tx.commit().map_err(storage_err)?;
        Ok(summaries)
    }

    pub fn active_version(&self) -> &VersionId {
        &self.state.active_version
    }

    /// Stage a write; it is committed when the transaction finishes or on [`Self::flush`].
    pub fn stage(&mut self, write: StateWrite) -> Result<()> {
        buffer::stage(&self.tx, &write, &self.state.active_version)
    }

    pub fn has_pending_writes(&self) -> Result<bool> {
        Ok(!buffer::is_empty(&self.tx)?)
    }

    /// Run the commit protocol over the staged writes now.
    pub fn flush(&mut self) -> Result<Vec<CommitSummary>> {
        let max_depth = self.state.max_depth();
        let summaries = commit::flush(
            &self.tx,
            max_depth,
            self.state.clock.as_mut(),
            self.state.ids.as_mut(),
        )?;
        if summaries.iter().any(|s| s.touches(STORED_SCHEMA_KEY)) {
            self.state.catalog.invalidate();
        }
        self.state.sync_catalog(&self.tx)?;
        self.summaries.extend(summaries.iter().cloned());
        Ok(summaries)
    }

    pub fn execute<P: Params>(&mut self, sql: &str, params: P) -> Result<usize> {
        self.tx.execute(sql, params).map_err(storage_err)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.tx.execute_batch(sql).map_err(storage_err)
    }

    /// Read rows as JSON objects. Pending writes of this transaction are visible.
    pub fn query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Map<String, Value>>> {
        query_rows(&self.tx, sql, params)
    }

    pub fn get_state(&self, key: &EntityKey, version: Option<&VersionId>) -> Result<Option<CacheRow>> {
        let version = version.unwrap_or(&self.state.active_version);
        read_state(&self.tx, self.state.max_depth(), key, version)
    }

    pub fn create_version(&mut self, options: CreateVersion) -> Result<Version> {
        self.flush()?;
        let id = options
            .id
            .unwrap_or_else(|| VersionId::new(self.state.ids.next_id()));
        let name = options.name.unwrap_or_else(|| id.to_string());
        let from = options
            .from
            .unwrap_or_else(|| self.state.active_version.clone());
        let source = version::require_version(&self.tx, &from)?;
        let parent = match options.inherits_from {
            InheritsFrom::Global => Some(VersionId::global()),
            InheritsFrom::Version(parent) => {
                version::require_version(&self.tx, &parent)?;
                Some(parent)
            }
            InheritsFrom::None => None,
        };

        let created = Version {
            id,
            name,
            commit_id: source.commit_id,
            change_set_id: source.change_set_id,
            inherits_from: parent.clone(),
            created_at: self.state.clock.now(),
        };
        version::insert_version(&self.tx, &created)?;
        if let Some(parent) = &parent {
            let mut inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
            inheritance.add_edge(parent.clone(), created.id.clone())?;
            version::insert_edge(&self.tx, parent, &created.id)?;
        }
        commit::seed_version(&self.tx, &from, &created.id)?;
        files::seed_file_data(&self.tx, &from, &created.id)?;
        journal::append(
            &self.tx,
            &JournalEvent::VersionCreated {
                version: created.id.clone(),
                from: Some(from),
                inherits_from: parent,
            },
            &created.created_at,
        )?;
        info!(version = %created.id, name = %created.name, "created version");
        Ok(created)
    }

    pub fn add_inheritance(&mut self, parent: &VersionId, child: &VersionId) -> Result<()> {
        self.flush()?;
        version::require_version(&self.tx, parent)?;
        version::require_version(&self.tx, child)?;
        let mut inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        inheritance.add_edge(parent.clone(), child.clone())?;
        version::insert_edge(&self.tx, parent, child)?;
        let now = self.state.clock.now();
        journal::append(
            &self.tx,
            &JournalEvent::InheritanceAdded {
                parent: parent.clone(),
                child: child.clone(),
            },
            &now,
        )?;
        Ok(())
    }

    pub fn remove_inheritance(&mut self, parent: &VersionId, child: &VersionId) -> Result<()> {
        self.flush()?;
        if !version::delete_edge(&self.tx, parent, child)? {
            return Err(Error::InvalidOperation(format!(
                "version '{child}' does not inherit from '{parent}'"
            )));
        }
        let now = self.state.clock.now();
        journal::append(
            &self.tx,
            &JournalEvent::InheritanceRemoved {
                parent: parent.clone(),
                child: child.clone(),
            },
            &now,
        )?;
        Ok(())
    }

    /// Delete a version. Its children lose their inheritance edge and become roots.
    pub fn delete_version(&mut self, id: &VersionId) -> Result<()> {
        self.flush()?;
        if id.is_global() {
            return Err(Error::InvalidOperation(
                "the global version cannot be deleted".into(),
            ));
        }
        if *id == self.state.active_version {
            return Err(Error::InvalidOperation(format!(
                "version '{id}' is active; switch away before deleting it"
            )));
        }
        version::require_version(&self.tx, id)?;
        version::delete_version(&self.tx, id)?;
        cache::delete_version_rows(&self.tx, id, RowLayer::Any)?;
        let now = self.state.clock.now();
        journal::append(
            &self.tx,
            &JournalEvent::VersionDeleted { version: id.clone() },
            &now,
        )?;
        info!(version = %id, "deleted version");
        Ok(())
    }

    /// Make `id` the default target of reads and writes. Pending writes keep the version
    /// they were staged for.
    pub fn switch_active_version(&mut self, id: &VersionId) -> Result<()> {
        version::require_version(&self.tx, id)?;
        version::set_active(&self.tx, id)?;
        self.state.active_version = id.clone();
        Ok(())
    }

    pub fn append_change(&mut self, write: EntityWrite) -> Result<Change> {
        let id = ChangeId::new(self.state.ids.next_id());
        let now = self.state.clock.now();
        change_log::append_change(&self.tx, id, now, &write)
    }

    pub fn create_change_set(
        &mut self,
        elements: Vec<ChangeSetElement>,
        parents: Vec<ChangeSetId>,
    ) -> Result<ChangeSet> {
        let id = ChangeSetId::new(self.state.ids.next_id());
        let now = self.state.clock.now();
        graph::create_change_set(&self.tx, id, &now, elements, parents)
    }

    /// Commit node outside any version; no version tip moves.
    pub fn create_commit(
        &mut self,
        change_set_id: &ChangeSetId,
        parents: Vec<CommitId>,
    ) -> Result<CommitRecord> {
        let id = CommitId::new(self.state.ids.next_id());
        let now = self.state.clock.now();
        graph::create_commit(&self.tx, id, change_set_id.clone(), parents, None, now)
    }

    /// Commit an existing change set onto a version: the tip advances and the cache
    /// picks up the change set's changes.
    pub fn commit_change_set(
        &mut self,
        change_set_id: &ChangeSetId,
        version: Option<&VersionId>,
    ) -> Result<CommitRecord> {
        self.flush()?;
        let version_id = version
            .cloned()
            .unwrap_or_else(|| self.state.active_version.clone());
        let tip = version::require_version(&self.tx, &version_id)?;
        let inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        let commit_id = CommitId::new(self.state.ids.next_id());
        let now = self.state.clock.now();
        commit::advance_version(
            &self.tx,
            &inheritance,
            &version_id,
            commit_id.clone(),
            change_set_id.clone(),
            vec![tip.commit_id],
            now,
        )?;
        let record = graph::load_commit(&self.tx, &commit_id)?;
        let changes = change_log::change_set_changes(&self.tx, change_set_id)?;
        let summary = CommitSummary {
            version_id,
            commit_id,
            change_set_id: change_set_id.clone(),
            schema_keys: changes.iter().map(|c| c.change.schema_key.clone()).collect(),
            change_ids: changes.into_iter().map(|c| c.change.id).collect(),
        };
        if summary.touches(STORED_SCHEMA_KEY) {
            self.state.catalog.invalidate();
            self.state.sync_catalog(&self.tx)?;
        }
        self.summaries.push(summary);
        Ok(record)
    }

    pub fn write_file(
        &mut self,
        id: &str,
        path: &str,
        data: &[u8],
        version: Option<&VersionId>,
    ) -> Result<usize> {
        let version = version.unwrap_or(&self.state.active_version).clone();
        let inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        let file = FileContext { id, path, data };
        files::write_file(&self.tx, &self.state.plugins, &inheritance, &file, &version)
    }

    pub fn delete_file(&mut self, id: &str, version: Option<&VersionId>) -> Result<()> {
        let version = version.unwrap_or(&self.state.active_version).clone();
        let inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        files::delete_file(&self.tx, &inheritance, id, &version)
    }

    pub fn read_file(&self, id: &str, version: Option<&VersionId>) -> Result<Option<Vec<u8>>> {
        let version = version.unwrap_or(&self.state.active_version);
        let inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        files::read_file(&self.tx, &inheritance, id, version)
    }

    pub fn apply_change_set(
        &mut self,
        change_set_id: &ChangeSetId,
        version: Option<&VersionId>,
    ) -> Result<Vec<String>> {
        let version = version.unwrap_or(&self.state.active_version).clone();
        let inheritance = version::load_inheritance(&self.tx, self.state.max_depth())?;
        files::apply_change_set(&self.tx, &self.state.plugins, &inheritance, change_set_id, &version)
    }

    /// Store a schema in the catalog (tracked state of the global version) and
    /// regenerate the entity views.
    pub fn register_schema(&mut self, definition: Value) -> Result<StoredSchema> {
        let schema = StoredSchema::from_value(definition)?;
        if SchemaCatalog::is_builtin(&schema.key) {
            return Err(Error::invalid_schema(
                &schema.key,
                "the key belongs to a builtin schema",
            ));
        }
        let entry = EntityWrite::upsert(
            schema.storage_id(),
            STORED_SCHEMA_KEY,
            STORED_SCHEMA_VERSION,
            schema.catalog_content(),
        )
        .version(VersionId::global());
        self.stage(StateWrite::Tracked(entry))?;
        self.flush()?;
        Ok(schema)
    }
}

/// Resolve one entity through the buffer and the cache.
struct StateReader<'c> {
    conn: &'c Connection,
    cache: SqliteCache<'c>,
}

impl CacheStore for StateReader<'_> {
    fn own_row(
        &mut self,
        key: &EntityKey,
        version: &VersionId,
        layer: RowLayer,
    ) -> Result<Option<CacheRow>> {
        if let Some(row) = buffer::pending_row(self.conn, key, version, layer)? {
            return Ok(Some(row));
        }
        self.cache.own_row(key, version, layer)
    }

    fn put_row(&mut self, _row: CacheRow) -> Result<()> {
        Err(Error::InvalidOperation("state reads cannot write cache rows".into()))
    }
}

fn read_state(
    conn: &Connection,
    max_depth: usize,
    key: &EntityKey,
    version: &VersionId,
) -> Result<Option<CacheRow>> {
    version::require_version(conn, version)?;
    let inheritance: InheritanceGraph = version::load_inheritance(conn, max_depth)?;
    let mut reader = StateReader {
        conn,
        cache: SqliteCache::new(conn),
    };
    Ok(resolve_row(&mut reader, &inheritance, key, version, RowLayer::Any)?.map(|resolved| {
        let mut row = resolved.row;
        if resolved.depth > 0 {
            row.inherited_from_version_id = Some(resolved.source_version);
        }
        row.version_id = version.clone();
        row
    }))
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

fn query_rows<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params).map_err(storage_err)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(storage_err)? {
        let mut object = Map::new();
        for (index, name) in names.iter().enumerate() {
            let value = row.get_ref(index).map_err(storage_err)?;
            object.insert(name.clone(), json_value(value));
        }
        out.push(object);
    }
    Ok(out)
}

/// Create the genesis commit, `global`, the initial version and the active pointer.
fn bootstrap(conn: &Connection, state: &mut EngineState) -> Result<()> {
    if version::load_version(conn, &VersionId::global())?.is_some() {
        return Ok(());
    }
    let now = state.clock.now();
    let change_set = graph::create_change_set(
        conn,
        ChangeSetId::new(state.ids.next_id()),
        &now,
        Vec::new(),
        Vec::new(),
    )?;
    let genesis = graph::create_commit(
        conn,
        CommitId::new(state.ids.next_id()),
        change_set.id.clone(),
        Vec::new(),
        None,
        now.clone(),
    )?;

    let global = Version {
        id: VersionId::global(),
        name: VersionId::global().to_string(),
        commit_id: genesis.id.clone(),
        change_set_id: change_set.id.clone(),
        inherits_from: None,
        created_at: now.clone(),
    };
    version::insert_version(conn, &global)?;
    journal::append(
        conn,
        &JournalEvent::VersionCreated {
            version: global.id.clone(),
            from: None,
            inherits_from: None,
        },
        &now,
    )?;

    let initial = Version {
        id: VersionId::new(state.ids.next_id()),
        name: state.config.initial_version_name.clone(),
        commit_id: genesis.id,
        change_set_id: change_set.id,
        inherits_from: Some(global.id.clone()),
        created_at: now.clone(),
    };
    version::insert_version(conn, &initial)?;
    version::insert_edge(conn, &global.id, &initial.id)?;
    journal::append(
        conn,
        &JournalEvent::VersionCreated {
            version: initial.id.clone(),
            from: None,
            inherits_from: Some(global.id),
        },
        &now,
    )?;
    version::set_active(conn, &initial.id)?;
    info!(initial = %initial.id, "bootstrapped database");
    Ok(())
}
