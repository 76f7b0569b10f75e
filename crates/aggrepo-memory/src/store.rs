//! The in-memory store and its transactions.

use crate::eval::{Binding, RowMap, criterion_holds, join_holds, query_error};
use aggrepo_core::{
    ColumnInfo, Error, Result, Row, SchemaMap, StoreErrorKind, TableMeta, Value,
};
use aggrepo_query::clause::{NullsOrder, OrderDirection, split_column};
use aggrepo_query::{Criteria, Store, StoreTransaction, unit_of_work};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Store operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Query,
    Count,
    Insert,
    Update,
    Delete,
    Commit,
}

/// Snapshot of how many times each operation ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begins: u64,
    pub queries: u64,
    pub counts: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    begins: AtomicU64,
    queries: AtomicU64,
    counts: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    fn bump(&self, op: Operation) {
        let counter = match op {
            Operation::Begin => &self.begins,
            Operation::Query => &self.queries,
            Operation::Count => &self.counts,
            Operation::Insert => &self.inserts,
            Operation::Update => &self.updates,
            Operation::Delete => &self.deletes,
            Operation::Commit => &self.commits,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: Operation,
    table: Option<String>,
    /// `None` fails forever, `Some(n)` fails the next `n` matching calls
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    meta: Arc<TableMeta>,
    columns: Arc<ColumnInfo>,
    rows: Vec<RowMap>,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<String, MemoryTable>,
}

impl Tables {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| query_error(format!("no such table '{}'", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| query_error(format!("no such table '{}'", name)))
    }
}

/// A process-local store holding tables in memory.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    tables: Mutex<Tables>,
    stamp: AtomicI64,
    counters: Counters,
    failures: Mutex<Vec<FailureRule>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create an empty store with a name used in log events.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Mutex::new(Tables::default()),
            stamp: AtomicI64::new(0),
            counters: Counters::default(),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Create a store with one empty table per schema entry.
    pub fn from_schema(schema: &SchemaMap) -> Self {
        let store = Self::new();
        for table in schema.tables() {
            store.create_table(table.clone());
        }
        store
    }

    /// Create (or replace) an empty table.
    pub fn create_table(&self, meta: TableMeta) {
        let columns = Arc::new(ColumnInfo::new(
            meta.column_names().map(str::to_string).collect(),
        ));
        let name = meta.name.clone();
        tracing::debug!(store = %self.name, table = %name, "creating table");
        self.lock_tables().tables.insert(
            name,
            MemoryTable {
                meta: Arc::new(meta),
                columns,
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Insert one row in its own transaction.
    pub fn insert_row<I, K>(&self, table: &str, values: I) -> Result<Option<Value>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: BTreeMap<String, Value> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        unit_of_work(self, "memory.insert_row", |tx| tx.insert(table, &values))
    }

    /// Update rows in their own transaction, as an outside writer would.
    pub fn update_rows<I, K>(&self, table: &str, values: I, filter: &Criteria) -> Result<u64>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: BTreeMap<String, Value> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        unit_of_work(self, "memory.update_rows", |tx| tx.update(table, &values, filter))
    }

    /// Every row of `table` in insertion order (empty for unknown tables).
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.lock_tables();
        tables
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| project_all(t, r)).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock_tables()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(AtomicOrdering::Relaxed);
        StoreStats {
            begins: load(&c.begins),
            queries: load(&c.queries),
            counts: load(&c.counts),
            inserts: load(&c.inserts),
            updates: load(&c.updates),
            deletes: load(&c.deletes),
            commits: load(&c.commits),
            rollbacks: load(&c.rollbacks),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.begins,
            &c.queries,
            &c.counts,
            &c.inserts,
            &c.updates,
            &c.deletes,
            &c.commits,
            &c.rollbacks,
        ] {
            counter.store(0, AtomicOrdering::Relaxed);
        }
    }

    /// Make every `op` (on `table`, or on any table) fail until cleared.
    pub fn fail_on(&self, op: Operation, table: Option<&str>) {
        self.push_failure(op, table, None);
    }

    /// Make the next `op` (on `table`, or on any table) fail once.
    pub fn fail_next(&self, op: Operation, table: Option<&str>) {
        self.push_failure(op, table, Some(1));
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push_failure(&self, op: Operation, table: Option<&str>, remaining: Option<usize>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FailureRule {
                op,
                table: table.map(str::to_string),
                remaining,
            });
    }

    fn check(&self, op: Operation, table: Option<&str>) -> Result<()> {
        self.counters.bump(op);
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = failures.iter_mut().position(|rule| {
            rule.op == op
                && (rule.table.is_none() || rule.table.as_deref() == table)
                && rule.remaining != Some(0)
        });
        let Some(index) = hit else {
            return Ok(());
        };
        if let Some(remaining) = failures[index].remaining.as_mut() {
            *remaining -= 1;
        }
        failures.retain(|rule| rule.remaining != Some(0));
        tracing::debug!(store = %self.name, ?op, table, "injected failure");
        Err(Error::store(
            StoreErrorKind::Unavailable,
            format!("injected {:?} failure", op),
        ))
    }

    fn next_stamp(&self) -> Value {
        Value::BigInt(self.stamp.fetch_add(1, AtomicOrdering::SeqCst) + 1)
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        self.check(Operation::Begin, None)?;
        Ok(Box::new(MemoryTransaction {
            store: self,
            tables: self.lock_tables(),
            backup: None,
            committed: false,
        }))
    }
}

/// An open transaction on a [`MemoryStore`].
///
/// Holds the table lock until it finishes. Writes are applied in place; the
/// first write saves a backup that rollback restores.
pub struct MemoryTransaction<'store> {
    store: &'store MemoryStore,
    tables: MutexGuard<'store, Tables>,
    backup: Option<Tables>,
    committed: bool,
}

impl MemoryTransaction<'_> {
    fn save_backup(&mut self) {
        if self.backup.is_none() {
            self.backup = Some(self.tables.clone());
        }
    }

    fn restore(&mut self) {
        if let Some(backup) = self.backup.take() {
            *self.tables = backup;
        }
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Auto-rollback on drop if not committed
            self.restore();
        }
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn query(&mut self, criteria: &Criteria) -> Result<Vec<Row>> {
        let target = target_of(criteria)?;
        self.store.check(Operation::Query, Some(target))?;
        let table = self.tables.table(target)?;
        let indices = select(&self.tables, criteria, true)?;
        let rows = project(table, &indices, criteria)?;
        tracing::trace!(store = %self.store.name, table = target, rows = rows.len(), "query");
        Ok(rows)
    }

    fn count(&mut self, criteria: &Criteria) -> Result<u64> {
        let target = target_of(criteria)?;
        self.store.check(Operation::Count, Some(target))?;
        let indices = select(&self.tables, criteria, false)?;
        Ok(indices.len() as u64)
    }

    fn insert(&mut self, table: &str, values: &BTreeMap<String, Value>) -> Result<Option<Value>> {
        self.store.check(Operation::Insert, Some(table))?;
        self.save_backup();
        let stamp = self.store.next_stamp();
        let mem = self.tables.table_mut(table)?;
        let meta = Arc::clone(&mem.meta);

        if let Some(unknown) = values.keys().find(|c| !meta.has_column(c)) {
            return Err(Error::store(
                StoreErrorKind::Constraint,
                format!("no column '{}' on '{}'", unknown, table),
            ));
        }

        let mut row: RowMap = meta
            .column_names()
            .map(|c| (c.to_string(), values.get(c).cloned().unwrap_or(Value::Null)))
            .collect();

        let mut generated = None;
        if let Some(auto) = meta.auto_increment_column() {
            match row.get(auto) {
                Some(v) if !v.is_null() => {
                    if let Some(id) = v.as_i64() {
                        mem.next_id = mem.next_id.max(id + 1);
                    }
                }
                _ => {
                    let id = Value::BigInt(mem.next_id);
                    mem.next_id += 1;
                    row.insert(auto.to_string(), id.clone());
                    generated = Some(id);
                }
            }
        }

        let key_columns: Vec<&str> = meta.primary_key_columns().collect();
        if key_columns.iter().any(|c| row.get(*c).is_none_or(Value::is_null)) {
            return Err(Error::store(
                StoreErrorKind::Constraint,
                format!("primary key of '{}' must not be NULL", table),
            ));
        }
        let duplicate = mem.rows.iter().any(|existing| {
            key_columns
                .iter()
                .all(|c| match (existing.get(*c), row.get(*c)) {
                    (Some(a), Some(b)) => a.loose_eq(b),
                    _ => false,
                })
        });
        if !key_columns.is_empty() && duplicate {
            return Err(Error::store(
                StoreErrorKind::Constraint,
                format!("duplicate primary key in '{}'", table),
            ));
        }

        if let Some(marker) = meta.staleness_column.as_deref() {
            row.insert(marker.to_string(), stamp);
        }
        mem.rows.push(row);
        tracing::trace!(store = %self.store.name, table, "insert");
        Ok(generated)
    }

    fn update(
        &mut self,
        table: &str,
        values: &BTreeMap<String, Value>,
        filter: &Criteria,
    ) -> Result<u64> {
        self.store.check(Operation::Update, Some(table))?;
        let filter = filter.clone().select_from(table).without_paging();
        let indices = select(&self.tables, &filter, false)?;
        self.save_backup();
        let stamp = self.store.next_stamp();
        let mem = self.tables.table_mut(table)?;
        let meta = Arc::clone(&mem.meta);
        if let Some(unknown) = values.keys().find(|c| !meta.has_column(c)) {
            return Err(Error::store(
                StoreErrorKind::Constraint,
                format!("no column '{}' on '{}'", unknown, table),
            ));
        }
        for &index in &indices {
            let row = &mut mem.rows[index];
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
            if let Some(marker) = meta.staleness_column.as_deref() {
                row.insert(marker.to_string(), stamp.clone());
            }
        }
        tracing::trace!(store = %self.store.name, table, rows = indices.len(), "update");
        Ok(indices.len() as u64)
    }

    fn delete(&mut self, table: &str, filter: &Criteria) -> Result<u64> {
        self.store.check(Operation::Delete, Some(table))?;
        let filter = filter.clone().select_from(table).without_paging();
        let doomed: HashSet<usize> = select(&self.tables, &filter, false)?.into_iter().collect();
        self.save_backup();
        let mem = self.tables.table_mut(table)?;
        let mut index = 0;
        mem.rows.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        tracing::trace!(store = %self.store.name, table, rows = doomed.len(), "delete");
        Ok(doomed.len() as u64)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.store.check(Operation::Commit, None)?;
        self.committed = true;
        self.backup = None;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.store.counters.rollbacks.fetch_add(1, AtomicOrdering::Relaxed);
        self.restore();
        self.committed = true;
        Ok(())
    }
}

fn target_of(criteria: &Criteria) -> Result<&str> {
    criteria
        .target()
        .ok_or_else(|| query_error("criteria name no target table"))
}

/// Indices of target rows matching `criteria`, ordered and (optionally) paged.
fn select(tables: &Tables, criteria: &Criteria, paged: bool) -> Result<Vec<usize>> {
    let target = target_of(criteria)?;
    let table = tables.table(target)?;
    let others: Vec<(&str, &MemoryTable)> = criteria
        .tables()
        .into_iter()
        .filter(|t| *t != target)
        .map(|t| tables.table(t).map(|mem| (t, mem)))
        .collect::<Result<_>>()?;

    let mut matched = Vec::new();
    for (index, row) in table.rows.iter().enumerate() {
        let mut binding = Binding::new(target, row);
        if satisfiable(&mut binding, &others, criteria)? {
            matched.push(index);
        }
    }

    if !criteria.ordering().is_empty() {
        sort_rows(table, &mut matched, criteria)?;
    }

    if !criteria.grouping().is_empty() {
        matched = group_rows(target, table, matched, criteria)?;
    }

    if criteria.is_single_record() && matched.len() > 1 {
        return Err(query_error(format!(
            "expected a single record from '{}', found {}",
            target,
            matched.len()
        )));
    }

    if paged {
        let offset = usize::try_from(criteria.offset_value().unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = criteria
            .limit_value()
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        matched = matched.into_iter().skip(offset).take(limit).collect();
    }
    Ok(matched)
}

/// Semi-join search: is there one row per joined table making every join and
/// predicate hold?
fn satisfiable<'a>(
    binding: &mut Binding<'a>,
    others: &[(&'a str, &'a MemoryTable)],
    criteria: &Criteria,
) -> Result<bool> {
    let depth = binding.len() - 1;
    if depth == others.len() {
        for join in criteria.joins() {
            if !join_holds(join, binding)? {
                return Ok(false);
            }
        }
        for criterion in criteria.criteria() {
            if !criterion_holds(criterion, binding, criteria.is_ignore_case())? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    let (name, table) = others[depth];
    for row in &table.rows {
        binding.push(name, row);
        let found = satisfiable(binding, others, criteria)?;
        binding.pop();
        if found {
            return Ok(true);
        }
    }
    Ok(false)
}

fn sort_rows(table: &MemoryTable, indices: &mut [usize], criteria: &Criteria) -> Result<()> {
    let mut keys = Vec::with_capacity(criteria.ordering().len());
    for order in criteria.ordering() {
        let column = own_column(&table.meta, order.column())?;
        keys.push((column, order.direction(), order.nulls()));
    }
    indices.sort_by(|a, b| {
        let (ra, rb) = (&table.rows[*a], &table.rows[*b]);
        for (column, direction, nulls) in &keys {
            let va = ra.get(*column).unwrap_or(&Value::Null);
            let vb = rb.get(*column).unwrap_or(&Value::Null);
            let ordering = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => match nulls {
                    NullsOrder::First => Ordering::Less,
                    NullsOrder::Last => Ordering::Greater,
                },
                (false, true) => match nulls {
                    NullsOrder::First => Ordering::Greater,
                    NullsOrder::Last => Ordering::Less,
                },
                (false, false) => {
                    let natural = va.compare(vb).unwrap_or(Ordering::Equal);
                    match direction {
                        OrderDirection::Asc => natural,
                        OrderDirection::Desc => natural.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

/// Keep the first row of each group, then apply HAVING to it.
fn group_rows(
    target: &str,
    table: &MemoryTable,
    indices: Vec<usize>,
    criteria: &Criteria,
) -> Result<Vec<usize>> {
    let mut columns = Vec::with_capacity(criteria.grouping().len());
    for name in criteria.grouping() {
        columns.push(own_column(&table.meta, name)?);
    }
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for index in indices {
        let row = &table.rows[index];
        let group: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(ToString::to_string).unwrap_or_default())
            .collect();
        if !seen.insert(group) {
            continue;
        }
        if let Some(having) = criteria.having_clause() {
            let binding = Binding::new(target, row);
            if !criterion_holds(having, &binding, criteria.is_ignore_case())? {
                continue;
            }
        }
        kept.push(index);
    }
    Ok(kept)
}

/// Resolve a bare or `table.column` name to a column of the target table.
fn own_column<'a>(meta: &TableMeta, name: &'a str) -> Result<&'a str> {
    let (table, column) = split_column(name);
    if table.is_some_and(|t| t != meta.name) || !meta.has_column(column) {
        return Err(query_error(format!(
            "'{}' is not a column of '{}'",
            name, meta.name
        )));
    }
    Ok(column)
}

fn project_all(table: &MemoryTable, row: &RowMap) -> Row {
    let values = table
        .columns
        .names()
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    Row::with_columns(Arc::clone(&table.columns), values)
}

fn project(table: &MemoryTable, indices: &[usize], criteria: &Criteria) -> Result<Vec<Row>> {
    if criteria.selected_columns().is_empty() {
        return Ok(indices
            .iter()
            .map(|i| project_all(table, &table.rows[*i]))
            .collect());
    }

    let mut names = Vec::with_capacity(criteria.selected_columns().len());
    for name in criteria.selected_columns() {
        names.push(own_column(&table.meta, name)?.to_string());
    }
    let columns = Arc::new(ColumnInfo::new(names.clone()));
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(indices.len());
    for index in indices {
        let source = &table.rows[*index];
        let values: Vec<Value> = names
            .iter()
            .map(|c| source.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if criteria.is_distinct() {
            let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
            if !seen.insert(rendered) {
                continue;
            }
        }
        rows.push(Row::with_columns(Arc::clone(&columns), values));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggrepo_query::{Comparison, Join, OrderBy};

    fn blog() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(
            TableMeta::new("post")
                .auto_key("id")
                .attribute("title")
                .attribute("author")
                .staleness_column("modified"),
        );
        store.create_table(
            TableMeta::new("comment")
                .auto_key("id")
                .attribute("post_id")
                .attribute("body"),
        );
        for (title, author) in [("first", "ann"), ("second", "bob"), ("third", "ann")] {
            store
                .insert_row("post", [("title", Value::from(title)), ("author", Value::from(author))])
                .unwrap();
        }
        for (post, body) in [(1_i64, "nice"), (1, "agreed"), (3, "hmm")] {
            store
                .insert_row("comment", [("post_id", Value::BigInt(post)), ("body", Value::from(body))])
                .unwrap();
        }
        store
    }

    fn query(store: &MemoryStore, criteria: &Criteria) -> Result<Vec<Row>> {
        unit_of_work(store, "test", |tx| tx.query(criteria))
    }

    fn titles(rows: &[Row]) -> Vec<String> {
        rows.iter()
            .map(|r| r.get_by_name("title").unwrap().to_string())
            .collect()
    }

    #[test]
    fn generated_keys_and_marker_stamps() {
        let store = blog();
        let rows = store.rows("post");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get_by_name("id"), Some(&Value::BigInt(3)));
        let stamps: Vec<&Value> = rows.iter().map(|r| r.get_by_name("modified").unwrap()).collect();
        assert!(stamps[0].compare(stamps[1]) == Some(Ordering::Less));
    }

    #[test]
    fn filters_orders_and_pages() {
        let store = blog();
        let criteria = Criteria::new()
            .select_from("post")
            .eq("post", "author", "ann")
            .order_by(OrderBy::desc("post.id"));
        assert_eq!(titles(&query(&store, &criteria).unwrap()), vec!["third", "first"]);

        let paged = Criteria::new().select_from("post").asc("id").offset(1).limit(1);
        assert_eq!(titles(&query(&store, &paged).unwrap()), vec!["second"]);

        let like = Criteria::new()
            .select_from("post")
            .filter("post", "title", Comparison::Like, "%ir%");
        assert_eq!(titles(&query(&store, &like).unwrap()), vec!["first", "third"]);
    }

    #[test]
    fn joins_select_children_of_one_parent() {
        let store = blog();
        let criteria = Criteria::new()
            .select_from("comment")
            .eq("post", "id", 1_i64)
            .join(Join::new("post.id", "comment.post_id"));
        let rows = query(&store, &criteria).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get_by_name("post_id") == Some(&Value::BigInt(1))));

        let none = Criteria::new()
            .select_from("comment")
            .eq("post", "id", 2_i64)
            .join(Join::new("post.id", "comment.post_id"));
        assert!(query(&store, &none).unwrap().is_empty());
    }

    #[test]
    fn distinct_projection_and_grouping() {
        let store = blog();
        let authors = Criteria::new()
            .select_from("post")
            .select_column("author")
            .distinct()
            .asc("author");
        let rows = query(&store, &authors).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);

        let grouped = Criteria::new().select_from("post").group_by("post.author");
        assert_eq!(query(&store, &grouped).unwrap().len(), 2);
    }

    #[test]
    fn count_ignores_paging() {
        let store = blog();
        let criteria = Criteria::new().select_from("post").limit(1);
        let total = unit_of_work(&store, "count", |tx| tx.count(&criteria)).unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn update_restamps_marker() {
        let store = blog();
        let before = store.rows("post")[0].get_by_name("modified").cloned().unwrap();
        let filter = Criteria::new().eq("post", "id", 1_i64);
        let changed = store
            .update_rows("post", [("title", Value::from("renamed"))], &filter)
            .unwrap();
        assert_eq!(changed, 1);
        let row = &store.rows("post")[0];
        assert_eq!(row.get_by_name("title"), Some(&Value::from("renamed")));
        let after = row.get_by_name("modified").unwrap();
        assert_eq!(after.compare(&before), Some(Ordering::Greater));
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let store = blog();
        let result = unit_of_work(&store, "test", |tx| {
            tx.delete("comment", &Criteria::new().eq("comment", "post_id", 1_i64))?;
            tx.insert("nope", &BTreeMap::new())
        });
        assert!(result.is_err());
        assert_eq!(store.row_count("comment"), 3);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = blog();
        {
            let mut tx = store.begin().unwrap();
            tx.delete("post", &Criteria::new()).unwrap();
        }
        assert_eq!(store.row_count("post"), 3);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let store = blog();
        let err = store.insert_row("post", [("id", Value::BigInt(2))]).unwrap_err();
        assert!(matches!(err, Error::Store(ref s) if s.kind == StoreErrorKind::Constraint));
        // explicit ids advance the generator
        store.insert_row("post", [("id", Value::BigInt(10))]).unwrap();
        let generated = store.insert_row("post", [("title", Value::from("x"))]).unwrap();
        assert_eq!(generated, Some(Value::BigInt(11)));
    }

    #[test]
    fn failure_injection_and_stats() {
        let store = blog();
        store.reset_stats();
        store.fail_next(Operation::Query, Some("post"));
        let criteria = Criteria::new().select_from("post");
        assert!(query(&store, &criteria).is_err());
        assert!(query(&store, &criteria).is_ok());
        assert_eq!(store.stats().queries, 2);

        store.fail_on(Operation::Update, None);
        assert!(store.update_rows("post", [("title", Value::Null)], &criteria).is_err());
        assert!(store.update_rows("post", [("title", Value::Null)], &criteria).is_err());
        store.clear_failures();
        assert!(store.update_rows("post", [("title", Value::Null)], &criteria).is_ok());
    }

    #[test]
    fn single_record_rejects_many() {
        let store = blog();
        let criteria = Criteria::new().select_from("post").single_record(true);
        assert!(query(&store, &criteria).is_err());
        let one = criteria.eq("post", "id", 2_i64);
        assert_eq!(query(&store, &one).unwrap().len(), 1);
    }

    #[test]
    fn unknown_tables_and_targets_are_errors() {
        let store = blog();
        assert!(query(&store, &Criteria::new()).is_err());
        assert!(query(&store, &Criteria::new().select_from("missing")).is_err());
    }
}
