//! Repositories: one identity-mapped cache per aggregate type.
//!
//! A repository owns, behind one mutex, the identity map of cached
//! aggregates (with their staleness markers) and the per-thread query memos.
//! Store I/O never runs while that mutex is held: sweeps copy what they need
//! out of the maps, release the lock, then commit, cancel or unload.

use crate::aggregate::{Aggregate, AggregateState};
use crate::config::GcPolicy;
use crate::context::Backend;
use crate::identity_map::IdentityMap;
use crate::memory::MemoryGate;
use crate::registry::AggregateBlueprint;
use crate::resolver::AggregateResolver;
use crate::snapshot::{AggregateSnapshot, rehydrate_into};
use crate::thread_session::ThreadSessions;
use aggrepo_core::{
    Error, IdentityKey, KeyPart, Result, Row, SchemaErrorKind, StoreErrorKind, TableMeta, Value,
};
use aggrepo_query::{Comparison, Criteria, Criterion, OrderBy, Page, Store, unit_of_work};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub committed: usize,
    pub cancelled: usize,
    pub unloaded: usize,
    pub evicted: usize,
    pub sessions_expired: usize,
    pub commit_failures: usize,
    /// Whether the container sweep ran (the memory gate was open)
    pub container_swept: bool,
}

impl GcReport {
    pub fn merge(&mut self, other: &GcReport) {
        self.committed += other.committed;
        self.cancelled += other.cancelled;
        self.unloaded += other.unloaded;
        self.evicted += other.evicted;
        self.sessions_expired += other.sessions_expired;
        self.commit_failures += other.commit_failures;
        self.container_swept |= other.container_swept;
    }

    /// Whether the sweep changed nothing.
    pub fn is_empty(&self) -> bool {
        self.committed + self.cancelled + self.unloaded + self.evicted + self.sessions_expired
            == 0
            && self.commit_failures == 0
    }
}

#[derive(Debug, Default)]
struct RepositoryMaps {
    identity: IdentityMap,
    sessions: ThreadSessions,
}

/// The cache of one aggregate type.
#[derive(Debug)]
pub struct Repository {
    blueprint: Arc<AggregateBlueprint>,
    backend: Arc<Backend>,
    me: Weak<Repository>,
    maps: Mutex<RepositoryMaps>,
}

impl Repository {
    pub(crate) fn new(blueprint: Arc<AggregateBlueprint>, backend: Arc<Backend>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            blueprint,
            backend,
            me: me.clone(),
            maps: Mutex::new(RepositoryMaps::default()),
        })
    }

    /// Aggregate type name.
    pub fn name(&self) -> &str {
        self.blueprint.name()
    }

    pub fn blueprint(&self) -> &Arc<AggregateBlueprint> {
        &self.blueprint
    }

    pub fn root_meta(&self) -> Result<Arc<TableMeta>> {
        let table = self.blueprint.root_table();
        self.backend.schema.table(table).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TableNotFound,
                format!("no schema for root table '{}'", table),
            )
        })
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.backend.store.as_ref()
    }

    pub(crate) fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub(crate) fn handle(&self) -> Weak<Repository> {
        self.me.clone()
    }

    /// Construct an empty aggregate bound to this repository (not cached).
    pub(crate) fn new_aggregate(&self, key: IdentityKey) -> Aggregate {
        Aggregate::new(
            Arc::clone(&self.blueprint),
            Arc::clone(&self.backend),
            self.me.clone(),
            key,
        )
    }

    fn lock_maps(&self) -> MutexGuard<'_, RepositoryMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_key(&self, key: &IdentityKey) -> Result<()> {
        if key.table() == self.blueprint.root_table() {
            return Ok(());
        }
        Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!(
                "key {} does not name a '{}' row",
                key,
                self.blueprint.root_table()
            ),
        ))
    }

    // ==================== Identity map ====================

    /// Cache `aggregate`; the last writer for a key wins.
    pub fn add(&self, aggregate: Arc<Aggregate>) -> Arc<Aggregate> {
        aggregate.touch();
        let replaced = self.lock_maps().identity.insert(Arc::clone(&aggregate));
        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, &aggregate)) {
            tracing::debug!(
                aggregate = self.name(),
                key = %old.key_string(),
                "replaced cached instance"
            );
        }
        aggregate
    }

    /// Cached aggregate for a rendered key. No side effects.
    pub fn get(&self, key: &str) -> Option<Arc<Aggregate>> {
        self.lock_maps().identity.get(key).cloned()
    }

    /// The cached aggregate for `key`, or a new empty one (state `NEW`) added
    /// to the cache. Performs no store I/O.
    pub fn get_or_create(&self, key: &IdentityKey) -> Result<Arc<Aggregate>> {
        self.check_key(key)?;
        if let Some(cached) = self.get(&key.render()) {
            cached.touch();
            return Ok(cached);
        }
        Ok(self.add(Arc::new(self.new_aggregate(key.clone()))))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock_maps().identity.contains(key)
    }

    /// Drop the entry for `aggregate`'s key and its marker.
    pub fn remove(&self, aggregate: &Aggregate) -> Option<Arc<Aggregate>> {
        self.remove_key(aggregate.key_string())
    }

    pub fn remove_key(&self, key: &str) -> Option<Arc<Aggregate>> {
        self.lock_maps().identity.remove(key)
    }

    /// Drop the entry only if it still holds this exact instance.
    pub fn remove_instance(&self, aggregate: &Aggregate) -> bool {
        self.lock_maps().identity.remove_instance(aggregate)
    }

    pub fn record_marker(&self, key: &str, marker: Value) {
        self.lock_maps().identity.record_marker(key, marker);
    }

    pub fn marker(&self, key: &str) -> Option<Value> {
        self.lock_maps().identity.marker(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock_maps().identity.keys()
    }

    pub fn len(&self) -> usize {
        self.lock_maps().identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_maps().identity.is_empty()
    }

    // ==================== Thread sessions ====================

    /// Memoize a query result for the calling thread.
    pub fn add_thread_session_query_result(&self, fingerprint: &str, aggregates: &[Arc<Aggregate>]) {
        let keys = aggregates
            .iter()
            .map(|a| a.key_string().to_string())
            .collect();
        let now = self.backend.clock.now();
        self.lock_maps()
            .sessions
            .store(thread::current().id(), fingerprint, keys, now);
    }

    /// The calling thread's memoized result for `fingerprint`.
    ///
    /// Served only if every key still resolves in the identity map; otherwise
    /// the entry is dropped and this is a miss.
    pub fn get_thread_session_query_result(&self, fingerprint: &str) -> Option<Vec<Arc<Aggregate>>> {
        let thread = thread::current().id();
        let now = self.backend.clock.now();
        let aggregates = {
            let mut maps = self.lock_maps();
            let keys = maps.sessions.lookup(thread, fingerprint)?;
            let resolved: Option<Vec<Arc<Aggregate>>> = keys
                .iter()
                .map(|key| maps.identity.get(key).cloned())
                .collect();
            match resolved {
                Some(aggregates) => {
                    maps.sessions.touch(thread, now);
                    aggregates
                }
                None => {
                    maps.sessions.forget(thread, fingerprint);
                    tracing::debug!(
                        aggregate = self.name(),
                        fingerprint,
                        "memoized result references an evicted aggregate, dropped"
                    );
                    return None;
                }
            }
        };
        aggregates.iter().for_each(|a| a.touch());
        Some(aggregates)
    }

    /// Refresh the calling thread's session.
    pub fn touch_thread_session(&self) {
        let now = self.backend.clock.now();
        self.lock_maps().sessions.touch(thread::current().id(), now);
    }

    pub fn remove_thread_session(&self, thread: ThreadId) -> bool {
        self.lock_maps().sessions.remove(thread)
    }

    pub fn thread_session_count(&self) -> usize {
        self.lock_maps().sessions.len()
    }

    // ==================== Reconciliation ====================

    /// One sweep at the clock's current time.
    ///
    /// The container sweep runs only when `gate` allows it; expired thread
    /// sessions are always dropped.
    pub fn gc(&self, policy: &GcPolicy, gate: &dyn MemoryGate) -> GcReport {
        let now = self.backend.clock.now();
        let mut report = if gate.should_sweep() {
            self.gc_container(now, policy)
        } else {
            tracing::trace!(aggregate = self.name(), "memory gate closed, container kept");
            GcReport::default()
        };
        report.sessions_expired = self.gc_sessions(now, policy.thread_session_lifetime);
        report
    }

    /// Age out cached aggregates as seen at `now`.
    ///
    /// Idle dirty aggregates are committed (auto-commit) or cancelled with a
    /// warning listing the discarded writes; idle loaded aggregates are
    /// unloaded; idle new or unloaded aggregates are evicted.
    pub fn gc_container(&self, now: Instant, policy: &GcPolicy) -> GcReport {
        let aggregates = self.lock_maps().identity.aggregates();
        let mut report = GcReport {
            container_swept: true,
            ..GcReport::default()
        };

        for aggregate in aggregates {
            let idle = aggregate.idle_for(now);
            match aggregate.state() {
                AggregateState::Dirty if idle > policy.dirty_age => {
                    self.age_out_dirty(&aggregate, idle, &mut report);
                }
                AggregateState::Loaded if idle > policy.loaded_age => {
                    aggregate.unload();
                    report.unloaded += 1;
                }
                AggregateState::New | AggregateState::Unloaded if idle > policy.new_age => {
                    if self.remove_instance(&aggregate) {
                        tracing::debug!(key = %aggregate.key_string(), "evicted");
                        report.evicted += 1;
                    }
                }
                _ => {}
            }
        }

        if !report.is_empty() {
            tracing::debug!(aggregate = self.name(), ?report, "container swept");
        }
        report
    }

    fn age_out_dirty(&self, aggregate: &Aggregate, idle: Duration, report: &mut GcReport) {
        if aggregate.auto_commit() {
            match aggregate.commit() {
                Ok(_) => report.committed += 1,
                Err(e) => {
                    tracing::error!(
                        aggregate = self.name(),
                        key = %aggregate.key_string(),
                        error = %e,
                        "auto-commit of idle aggregate failed"
                    );
                    report.commit_failures += 1;
                }
            }
            return;
        }
        tracing::warn!(
            aggregate = self.name(),
            key = %aggregate.key_string(),
            idle_secs = idle.as_secs(),
            dirty = ?aggregate.dirty_attributes(),
            "discarding pending changes of idle aggregate"
        );
        aggregate.cancel();
        report.cancelled += 1;
    }

    /// Drop thread sessions idle longer than `lifetime` as seen at `now`.
    pub fn gc_sessions(&self, now: Instant, lifetime: Duration) -> usize {
        let expired = self.lock_maps().sessions.expire(now, lifetime);
        if expired > 0 {
            tracing::trace!(aggregate = self.name(), expired, "thread sessions expired");
        }
        expired
    }

    // ==================== Finders ====================

    pub fn resolver(&self) -> AggregateResolver<'_> {
        AggregateResolver::new(self)
    }

    /// Aggregates whose root rows match `criteria`, memoized per thread.
    pub fn find_by_criteria(&self, criteria: &Criteria) -> Result<Vec<Arc<Aggregate>>> {
        self.resolver().find_by_criteria(criteria)
    }

    /// First aggregate matching `criteria`.
    pub fn find_one(&self, criteria: &Criteria) -> Result<Option<Arc<Aggregate>>> {
        let criteria = criteria.clone().limit(1);
        Ok(self.find_by_criteria(&criteria)?.into_iter().next())
    }

    /// Aggregate for a root key, from the cache or the store.
    pub fn find_by_key(&self, key: &IdentityKey) -> Result<Option<Arc<Aggregate>>> {
        self.check_key(key)?;
        if let Some(cached) = self.get(&key.render()) {
            cached.touch();
            return Ok(Some(cached));
        }

        let rows = unit_of_work(self.store(), "repository.find_by_key", |tx| {
            tx.query(&Criteria::for_key(key))
        })?;
        if rows.len() > 1 {
            tracing::warn!(
                aggregate = self.name(),
                key = %key,
                rows = rows.len(),
                "key matched more than one row, using the first"
            );
        }
        match rows.first() {
            Some(row) => self.resolver().resolve(row),
            None => Ok(None),
        }
    }

    /// Aggregate whose key column `column` (the sole key column when `None`)
    /// equals `value`.
    pub fn find_by_id(
        &self,
        value: impl Into<Value>,
        column: Option<&str>,
    ) -> Result<Option<Arc<Aggregate>>> {
        let meta = self.root_meta()?;
        let keys: Vec<&str> = meta.primary_key_columns().collect();
        let column = match (column, keys.as_slice()) {
            (Some(column), _) if keys.contains(&column) && keys.len() == 1 => column,
            (None, [only]) => *only,
            _ => {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!(
                        "'{}' has no single key column{}",
                        meta.name,
                        column.map(|c| format!(" named '{}'", c)).unwrap_or_default()
                    ),
                ));
            }
        };
        self.find_by_key(&IdentityKey::single(&meta.name, column, value))
    }

    /// Every aggregate, up to the configured select-all limit.
    pub fn find_all(&self, order_by: &[OrderBy]) -> Result<Vec<Arc<Aggregate>>> {
        let limit = self.backend.config.select_all_limit;
        let total = self.count(&Criteria::new())?;
        if total > limit {
            tracing::warn!(
                aggregate = self.name(),
                total,
                limit,
                "select-all truncated to the configured limit"
            );
        }
        let criteria = order_by
            .iter()
            .cloned()
            .fold(Criteria::new(), Criteria::order_by)
            .limit(limit);
        self.find_by_criteria(&criteria)
    }

    /// Number of root rows matching `criteria` that carry a root key.
    pub fn count(&self, criteria: &Criteria) -> Result<u64> {
        let meta = self.root_meta()?;
        let mut criteria = criteria.clone().select_from(meta.name.as_str());
        for column in meta.primary_key_columns() {
            let not_null = Criterion::new(&meta.name, column, Comparison::IsNotNull, Value::Null);
            if criteria.get(&not_null.key()).is_none() {
                criteria.insert(not_null);
            }
        }
        unit_of_work(self.store(), "repository.count", |tx| tx.count(&criteria))
    }

    /// Raw root rows, bypassing the cache. The root table is the default target.
    pub fn find_raw(&self, criteria: &Criteria) -> Result<Vec<Row>> {
        let criteria = match criteria.target() {
            Some(_) => criteria.clone(),
            None => criteria.clone().select_from(self.blueprint.root_table()),
        };
        unit_of_work(self.store(), "repository.find_raw", |tx| tx.query(&criteria))
    }

    /// One page of aggregates; `page` is 1-based.
    pub fn find_page(&self, criteria: &Criteria, page: u64, per_page: u64) -> Result<Page<Arc<Aggregate>>> {
        let page = page.max(1);
        let total = self.count(&criteria.clone().without_paging())?;
        let paged = criteria
            .clone()
            .without_paging()
            .limit(per_page)
            .offset(Page::<()>::offset_for(page, per_page));
        let items = self.find_by_criteria(&paged)?;
        Ok(Page {
            items,
            page,
            per_page,
            total,
        })
    }

    // ==================== Creation ====================

    /// Insert a root row and return its aggregate.
    pub fn create<I, K>(&self, values: I) -> Result<Arc<Aggregate>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let meta = self.root_meta()?;
        let mut values: BTreeMap<String, Value> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let generated = unit_of_work(self.store(), "repository.create", |tx| {
            tx.insert(&meta.name, &values)
        })?;
        if let (Some(id), Some(column)) = (generated, meta.auto_increment_column()) {
            values.insert(column.to_string(), id);
        }

        let parts = meta
            .primary_key_columns()
            .map(|column| {
                values
                    .get(column)
                    .filter(|v| !v.is_null())
                    .map(|v| KeyPart::new(&meta.name, column, v.clone()))
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::MissingPrimaryKey,
                    format!("new '{}' row has no complete key", meta.name),
                )
            })?;
        let key = IdentityKey::composite(parts)?;
        let aggregate = self.find_by_key(&key)?.ok_or_else(|| {
            Error::store(
                StoreErrorKind::Query,
                format!("inserted row {} could not be read back", key),
            )
        })?;
        tracing::debug!(aggregate = self.name(), key = %key, "created");
        Ok(aggregate)
    }

    /// Rebuild an aggregate from a snapshot and cache it.
    pub fn restore(&self, snapshot: &AggregateSnapshot) -> Result<Arc<Aggregate>> {
        let aggregate = rehydrate_into(self, snapshot)?;
        Ok(self.add(Arc::new(aggregate)))
    }
}
