//! Aggregates: a root record plus the child records it owns.
//!
//! An aggregate is shared as `Arc<Aggregate>` between every thread that
//! resolves it. Its records sit behind a per-aggregate mutex; that mutex keeps
//! the records memory-safe but does not serialize logical edits, so two
//! threads writing the same aggregate share one overlay and one commit.
//!
//! # Lifecycle
//!
//! The lifecycle state is derived from the records on every call:
//!
//! | State | Condition |
//! |-------|-----------|
//! | `Dirty` | any record has pending writes |
//! | `New` | no root record has been constructed |
//! | `Loaded` | root populated, or some child collection non-empty |
//! | `Unloaded` | root constructed but empty, no children |
//!
//! Store I/O runs while the aggregate lock is held but never while the
//! repository lock is held; the lock order is always aggregate, then
//! repository.

use crate::context::Backend;
use crate::record::{EntityRecord, row_key};
use crate::registry::AggregateBlueprint;
use crate::repository::Repository;
use crate::snapshot::AggregateSnapshot;
use aggrepo_core::{Error, IdentityKey, KeyError, Result, Row, SchemaErrorKind, TableMeta, Value};
use aggrepo_query::{Criteria, Join, Store, StoreTransaction, unit_of_work};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Pending writes: table, then record key string, then column.
pub type DirtyAttributes = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

pub(crate) type Children = BTreeMap<String, BTreeMap<String, EntityRecord>>;

/// Lifecycle state of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateState {
    New,
    Loaded,
    Dirty,
    Unloaded,
}

impl AggregateState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AggregateState::New => "NEW",
            AggregateState::Loaded => "LOADED",
            AggregateState::Dirty => "DIRTY",
            AggregateState::Unloaded => "UNLOADED",
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct AggregateInner {
    root: Option<EntityRecord>,
    children: Children,
    children_loaded: bool,
    state: AggregateState,
    auto_commit: bool,
    cascade_on_delete: bool,
    deleted: bool,
}

impl AggregateInner {
    fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.root
            .iter()
            .chain(self.children.values().flat_map(BTreeMap::values))
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut EntityRecord> {
        self.root
            .iter_mut()
            .chain(self.children.values_mut().flat_map(BTreeMap::values_mut))
    }

    fn compute_state(&self) -> AggregateState {
        if self.records().any(EntityRecord::is_dirty) {
            return AggregateState::Dirty;
        }
        match &self.root {
            None => AggregateState::New,
            Some(root) if root.is_initialized() => AggregateState::Loaded,
            Some(_) if self.children.values().any(|c| !c.is_empty()) => AggregateState::Loaded,
            Some(_) => AggregateState::Unloaded,
        }
    }

    fn refresh_state(&mut self) -> AggregateState {
        self.state = self.compute_state();
        self.state
    }

    fn dirty_attributes(&self) -> DirtyAttributes {
        let mut out = DirtyAttributes::new();
        for record in self.records().filter(|r| r.is_dirty()) {
            out.entry(record.table().to_string())
                .or_default()
                .insert(record.key_string().to_string(), record.dirty_attributes().clone());
        }
        out
    }

    fn child(&self, table: &str, key: &str) -> Option<&EntityRecord> {
        self.children.get(table)?.get(key)
    }
}

/// A cached aggregate instance.
pub struct Aggregate {
    key: IdentityKey,
    key_string: String,
    blueprint: Arc<AggregateBlueprint>,
    backend: Arc<Backend>,
    repository: Weak<Repository>,
    created_at: Instant,
    last_access: Mutex<Instant>,
    inner: Mutex<AggregateInner>,
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("name", &self.blueprint.name())
            .field("key", &self.key_string)
            .field("state", &self.inner.try_lock().ok().map(|inner| inner.state))
            .finish_non_exhaustive()
    }
}

impl Aggregate {
    pub(crate) fn new(
        blueprint: Arc<AggregateBlueprint>,
        backend: Arc<Backend>,
        repository: Weak<Repository>,
        key: IdentityKey,
    ) -> Self {
        let auto_commit = blueprint.default_auto_commit();
        let cascade_on_delete = blueprint.default_cascade_on_delete();
        Self::with_contents(
            blueprint,
            backend,
            repository,
            key,
            None,
            Children::new(),
            auto_commit,
            cascade_on_delete,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_contents(
        blueprint: Arc<AggregateBlueprint>,
        backend: Arc<Backend>,
        repository: Weak<Repository>,
        key: IdentityKey,
        root: Option<EntityRecord>,
        children: Children,
        auto_commit: bool,
        cascade_on_delete: bool,
    ) -> Self {
        let now = backend.clock.now();
        let mut inner = AggregateInner {
            root,
            children_loaded: !children.is_empty(),
            children,
            state: AggregateState::New,
            auto_commit,
            cascade_on_delete,
            deleted: false,
        };
        inner.refresh_state();
        Self {
            key_string: key.render(),
            key,
            blueprint,
            backend,
            repository,
            created_at: now,
            last_access: Mutex::new(now),
            inner: Mutex::new(inner),
        }
    }

    // ==================== Identity & bookkeeping ====================

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Rendered identity key; the cache key in the repository.
    pub fn key_string(&self) -> &str {
        &self.key_string
    }

    /// Aggregate type name.
    pub fn name(&self) -> &str {
        self.blueprint.name()
    }

    pub fn blueprint(&self) -> &Arc<AggregateBlueprint> {
        &self.blueprint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last access, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    /// Refresh the last-access time.
    pub fn touch(&self) {
        let now = self.backend.clock.now();
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = now;
        tracing::trace!(aggregate = %self.key_string, "touched");
    }

    /// Recompute the lifecycle state from the records.
    pub fn state(&self) -> AggregateState {
        self.lock().refresh_state()
    }

    /// The state as of the last operation, without recomputing.
    pub fn recorded_state(&self) -> AggregateState {
        self.lock().state
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == AggregateState::Dirty
    }

    /// Whether `delete` has run. A deleted aggregate refuses further work.
    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn auto_commit(&self) -> bool {
        self.lock().auto_commit
    }

    pub fn set_auto_commit(&self, value: bool) {
        self.lock().auto_commit = value;
    }

    pub fn cascade_on_delete(&self) -> bool {
        self.lock().cascade_on_delete
    }

    pub fn set_cascade_on_delete(&self, value: bool) {
        self.lock().cascade_on_delete = value;
    }

    /// Pending writes of every dirty record.
    pub fn dirty_attributes(&self) -> DirtyAttributes {
        self.lock().dirty_attributes()
    }

    // ==================== Lifecycle ====================

    /// Populate the root (lazily, by key) and every declared child collection.
    ///
    /// A dirty aggregate is left as it is.
    #[tracing::instrument(level = "debug", skip(self), fields(aggregate = %self.key_string))]
    pub fn load(&self) -> Result<AggregateState> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        if inner.compute_state() == AggregateState::Dirty {
            tracing::debug!(aggregate = %self.key_string, "pending changes, load skipped");
            return Ok(inner.refresh_state());
        }
        self.load_locked(&mut inner)?;
        Ok(inner.refresh_state())
    }

    /// Query every child collection and swap them in.
    ///
    /// Nothing changes unless every child query succeeds.
    pub fn load_children(&self) -> Result<()> {
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        let children = unit_of_work(self.store(), "aggregate.load_children", |tx| {
            self.query_children(tx)
        })?;
        inner.children = children;
        inner.children_loaded = true;
        inner.refresh_state();
        Ok(())
    }

    /// Flush every pending write in one unit of work.
    ///
    /// Returns `false` when there was nothing to commit. On failure the
    /// pending writes stay in place and the aggregate stays dirty.
    #[tracing::instrument(level = "debug", skip(self), fields(aggregate = %self.key_string))]
    pub fn commit(&self) -> Result<bool> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        if inner.compute_state() != AggregateState::Dirty {
            return Ok(false);
        }

        let contents = &*inner;
        let flushed = unit_of_work(self.store(), "aggregate.commit", |tx| {
            let mut updated = 0;
            if let Some(root) = &contents.root {
                updated += root.flush(tx, true)?;
            }
            for record in contents
                .children
                .values()
                .flat_map(BTreeMap::values)
                .filter(|r| r.is_dirty())
            {
                updated += record.flush(tx, false)?;
            }
            Ok(updated)
        });

        match flushed {
            Ok(updated) => {
                inner.records_mut().for_each(EntityRecord::apply_flushed);
                inner.refresh_state();
                tracing::debug!(aggregate = %self.key_string, rows = updated, "committed");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    aggregate = %self.key_string,
                    error = %e,
                    "commit failed, aggregate stays dirty"
                );
                Err(e)
            }
        }
    }

    /// Discard every pending write. Returns `false` when there was none.
    pub fn cancel(&self) -> bool {
        self.touch();
        let mut inner = self.lock();
        if inner.compute_state() != AggregateState::Dirty {
            return false;
        }
        inner.records_mut().for_each(EntityRecord::cancel);
        inner.refresh_state();
        tracing::debug!(aggregate = %self.key_string, "cancelled pending changes");
        true
    }

    /// Drop every loaded value. The aggregate stays cached.
    pub fn unload(&self) -> AggregateState {
        self.touch();
        let mut inner = self.lock();
        if inner.compute_state() == AggregateState::Dirty {
            tracing::warn!(
                aggregate = %self.key_string,
                dirty = ?inner.dirty_attributes(),
                "unloading discards pending changes"
            );
        }
        if let Some(root) = inner.root.as_mut() {
            root.unload();
        }
        inner.children.clear();
        inner.children_loaded = false;
        let state = inner.refresh_state();
        tracing::debug!(aggregate = %self.key_string, %state, "unloaded");
        state
    }

    /// Delete the root row (and, with cascade, every child row) and detach
    /// the aggregate from its repository.
    #[tracing::instrument(level = "debug", skip(self), fields(aggregate = %self.key_string))]
    pub fn delete(&self) -> Result<()> {
        self.touch();
        {
            let mut inner = self.lock();
            self.ensure_attached(&inner)?;
            let cascade = inner.cascade_on_delete;
            let root_table = self.blueprint.root_table();
            unit_of_work(self.store(), "aggregate.delete", |tx| {
                if cascade {
                    for record in self.query_children(tx)?.values().flat_map(BTreeMap::values) {
                        record.delete(tx)?;
                    }
                }
                let deleted = tx.delete(root_table, &Criteria::for_key(&self.key))?;
                if deleted == 0 {
                    tracing::warn!(aggregate = %self.key_string, "no root row to delete");
                }
                Ok(())
            })?;
            inner.deleted = true;
            inner.children.clear();
            inner.refresh_state();
        }
        if let Some(repository) = self.repository.upgrade() {
            repository.remove_instance(self);
        }
        Ok(())
    }

    // ==================== Root access ====================

    /// Current value of a root column, loading the root on first read.
    pub fn root_value(&self, column: &str) -> Result<Option<Value>> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        let root = self.ensure_root(&mut inner)?;
        Ok(root.value(column).cloned())
    }

    /// Write a root column.
    pub fn set_root_value(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_root(&mut inner)?.set(column, value)?;
        inner.refresh_state();
        Ok(())
    }

    // ==================== Child access ====================

    /// Key strings of the loaded children of `table`.
    pub fn child_keys(&self, table: &str) -> Result<Vec<String>> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_child_declared(table)?;
        self.ensure_loaded(&mut inner)?;
        Ok(inner
            .children
            .get(table)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Current value of a child column. `None` when there is no such child.
    pub fn child_value(&self, table: &str, key: &str, column: &str) -> Result<Option<Value>> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_child_declared(table)?;
        self.ensure_loaded(&mut inner)?;
        Ok(inner
            .child(table, key)
            .and_then(|record| record.value(column))
            .cloned())
    }

    /// Write a child column.
    pub fn set_child_value(
        &self,
        table: &str,
        key: &str,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_child_declared(table)?;
        self.ensure_loaded(&mut inner)?;
        let record = inner
            .children
            .get_mut(table)
            .and_then(|c| c.get_mut(key))
            .ok_or_else(|| KeyError {
                input: key.to_string(),
                message: format!("no '{}' child with this key", table),
            })?;
        record.set(column, value)?;
        inner.refresh_state();
        Ok(())
    }

    /// Insert a child row and add it to the aggregate.
    ///
    /// Relation columns are filled from the root. Returns the new child's
    /// key string.
    pub fn create_child<I, K>(&self, table: &str, values: I) -> Result<String>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_child_declared(table)?;
        self.ensure_loaded(&mut inner)?;
        let meta = self.table_meta(table)?;

        let mut values: BTreeMap<String, Value> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if let (Some(relation), Some(root)) = (
            self.blueprint
                .relation_for(table)
                .filter(|r| r.is_well_formed()),
            inner.root.as_ref(),
        ) {
            for (left, right) in relation.left.iter().zip(&relation.right) {
                if let Some(value) = root.value(left) {
                    values.insert(right.clone(), value.clone());
                }
            }
        }

        let record = unit_of_work(self.store(), "aggregate.create_child", |tx| {
            let generated = tx.insert(table, &values)?;
            let mut row_values = values.clone();
            if let (Some(id), Some(column)) = (generated, meta.auto_increment_column()) {
                row_values.insert(column.to_string(), id);
            }
            let key = row_key(&meta, &Row::from_pairs(row_values)).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::MissingPrimaryKey,
                    format!("new '{}' row has no complete key", table),
                )
            })?;
            let mut record = EntityRecord::new(Arc::clone(&meta), key);
            record.load(tx)?;
            Ok(record)
        })?;

        let key = record.key_string().to_string();
        inner
            .children
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), record);
        inner.refresh_state();
        tracing::debug!(aggregate = %self.key_string, child = table, key = %key, "child created");
        Ok(key)
    }

    /// Delete a child row. Returns `false` when there is no such child.
    pub fn remove_child(&self, table: &str, key: &str) -> Result<bool> {
        self.touch();
        let mut inner = self.lock();
        self.ensure_attached(&inner)?;
        self.ensure_child_declared(table)?;
        self.ensure_loaded(&mut inner)?;
        let Some(record) = inner.child(table, key) else {
            return Ok(false);
        };
        unit_of_work(self.store(), "aggregate.remove_child", |tx| record.delete(tx))?;
        if let Some(collection) = inner.children.get_mut(table) {
            collection.remove(key);
        }
        inner.refresh_state();
        Ok(true)
    }

    /// Capture the aggregate as plain data.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let inner = self.lock();
        AggregateSnapshot {
            aggregate: self.blueprint.name().to_string(),
            key: self.key.clone(),
            auto_commit: inner.auto_commit,
            cascade_on_delete: inner.cascade_on_delete,
            root: inner.root.as_ref().map(EntityRecord::to_snapshot),
            children: inner
                .children
                .iter()
                .map(|(table, records)| {
                    (
                        table.clone(),
                        records.values().map(EntityRecord::to_snapshot).collect(),
                    )
                })
                .collect(),
        }
    }

    // ==================== Crate-internal ====================

    /// Construct the root from a row already read from the store.
    pub(crate) fn populate_root(&self, row: &Row) -> Result<()> {
        let meta = self.table_meta(self.blueprint.root_table())?;
        let mut inner = self.lock();
        let root = inner
            .root
            .get_or_insert_with(|| EntityRecord::new(meta, self.key.clone()));
        root.initialize(row);
        inner.refresh_state();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, AggregateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> &dyn Store {
        self.backend.store.as_ref()
    }

    fn ensure_attached(&self, inner: &AggregateInner) -> Result<()> {
        if inner.deleted {
            return Err(Error::Detached(format!(
                "aggregate {} has been deleted",
                self.key_string
            )));
        }
        Ok(())
    }

    fn ensure_child_declared(&self, table: &str) -> Result<()> {
        if self.blueprint.has_child(table) {
            return Ok(());
        }
        Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!("'{}' is not a child of '{}'", table, self.blueprint.name()),
        ))
    }

    fn table_meta(&self, table: &str) -> Result<Arc<TableMeta>> {
        self.backend.schema.table(table).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TableNotFound,
                format!("no schema for table '{}'", table),
            )
        })
    }

    /// Construct the root if needed and read it by key on first use.
    fn ensure_root<'a>(&self, inner: &'a mut AggregateInner) -> Result<&'a mut EntityRecord> {
        let root = match inner.root.take() {
            Some(root) => root,
            None => EntityRecord::new(
                self.table_meta(self.blueprint.root_table())?,
                self.key.clone(),
            ),
        };
        let root = inner.root.insert(root);
        if !root.is_initialized() {
            unit_of_work(self.store(), "aggregate.load_root", |tx| root.load(tx))?;
            self.record_marker(root);
        }
        Ok(root)
    }

    /// Load the root and children unless both are already loaded.
    fn ensure_loaded(&self, inner: &mut AggregateInner) -> Result<()> {
        let root_ready = inner.root.as_ref().is_some_and(EntityRecord::is_initialized);
        if root_ready && inner.children_loaded {
            return Ok(());
        }
        self.load_locked(inner)?;
        inner.refresh_state();
        Ok(())
    }

    fn load_locked(&self, inner: &mut AggregateInner) -> Result<()> {
        let mut root = match &inner.root {
            Some(root) => root.clone(),
            None => EntityRecord::new(
                self.table_meta(self.blueprint.root_table())?,
                self.key.clone(),
            ),
        };
        let reload_root = !root.is_initialized();
        let children = unit_of_work(self.store(), "aggregate.load", |tx| {
            if reload_root {
                root.load(tx)?;
            }
            self.query_children(tx)
        })?;
        if reload_root {
            self.record_marker(&root);
        }
        inner.root = Some(root);
        inner.children = children;
        inner.children_loaded = true;
        tracing::debug!(
            aggregate = %self.key_string,
            children = inner.children.values().map(BTreeMap::len).sum::<usize>(),
            "loaded"
        );
        Ok(())
    }

    /// Remember the root's staleness marker after reading it by key.
    fn record_marker(&self, root: &EntityRecord) {
        let marker = root
            .staleness_column()
            .and_then(|column| root.committed_value(column))
            .filter(|marker| !marker.is_null());
        if let (Some(marker), Some(repository)) = (marker, self.repository.upgrade()) {
            repository.record_marker(&self.key_string, marker.clone());
        }
    }

    /// Read every declared child collection through its relation.
    fn query_children(&self, tx: &mut dyn StoreTransaction) -> Result<Children> {
        let root_table = self.blueprint.root_table();
        let mut children = Children::new();
        for table in self.blueprint.children() {
            children.insert(table.clone(), BTreeMap::new());

            let Some(meta) = self.backend.schema.table(table) else {
                tracing::warn!(aggregate = self.name(), child = %table, "no schema for child table, skipping");
                continue;
            };
            let joins = self
                .blueprint
                .relation_for(table)
                .and_then(|r| Join::between(root_table, &r.left, table, &r.right));
            let Some(joins) = joins else {
                tracing::warn!(
                    aggregate = self.name(),
                    child = %table,
                    "child relation missing or malformed, skipping"
                );
                continue;
            };

            let criteria = Criteria::for_key(&self.key)
                .select_from(table.as_str())
                .joins_with(joins)
                .distinct();
            let mut records = BTreeMap::new();
            for row in tx.query(&criteria)? {
                match EntityRecord::from_row(Arc::clone(&meta), &row) {
                    Some(record) => {
                        records.insert(record.key_string().to_string(), record);
                    }
                    None => {
                        tracing::warn!(child = %table, "child row without a complete key, skipping");
                    }
                }
            }
            children.insert(table.clone(), records);
        }
        Ok(children)
    }
}
