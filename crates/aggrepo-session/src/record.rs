//! Entity records: one row of one table, with a dirty overlay.
//!
//! A record keeps the attributes last read from (or written to) the store
//! separate from pending writes. Writes only ever touch the overlay; the base
//! attributes change when a row is read, when a flush succeeds, or on unload.

use crate::snapshot::RecordSnapshot;
use aggrepo_core::{Error, IdentityKey, KeyPart, Result, Row, SchemaErrorKind, TableMeta, Value};
use aggrepo_query::{Criteria, StoreTransaction};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extract the identity key of `meta`'s table from a row.
///
/// Returns `None` when the table has no primary key or any key column is
/// missing or null.
pub fn row_key(meta: &TableMeta, row: &Row) -> Option<IdentityKey> {
    let mut parts = Vec::new();
    for column in meta.primary_key_columns() {
        let value = row.get_qualified(&meta.name, column)?;
        if value.is_null() {
            return None;
        }
        parts.push(KeyPart::new(&meta.name, column, value.clone()));
    }
    IdentityKey::composite(parts).ok()
}

/// A single row owned by an aggregate.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    meta: Arc<TableMeta>,
    key: IdentityKey,
    key_string: String,
    attributes: BTreeMap<String, Value>,
    pending: BTreeMap<String, Value>,
    initialized: bool,
}

impl EntityRecord {
    /// Create an attribute-less record: every non-key column is `Null`.
    pub fn new(meta: Arc<TableMeta>, key: IdentityKey) -> Self {
        let attributes = meta
            .attribute_columns()
            .map(|c| (c.to_string(), Value::Null))
            .collect();
        Self {
            key_string: key.render(),
            meta,
            key,
            attributes,
            pending: BTreeMap::new(),
            initialized: false,
        }
    }

    /// Build and populate a record from a row, if the row carries its key.
    pub fn from_row(meta: Arc<TableMeta>, row: &Row) -> Option<Self> {
        let key = row_key(&meta, row)?;
        let mut record = Self::new(meta, key);
        record.initialize(row);
        Some(record)
    }

    pub fn table(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &Arc<TableMeta> {
        &self.meta
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn key_string(&self) -> &str {
        &self.key_string
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Column holding the staleness marker, if the table has one.
    pub fn staleness_column(&self) -> Option<&str> {
        self.meta.staleness_column.as_deref()
    }

    /// Populate the base attributes from a row.
    ///
    /// Columns are matched as `table.column` first, then as bare `column`.
    /// Columns the row does not carry keep their current value.
    pub fn initialize(&mut self, row: &Row) {
        for (column, value) in self.attributes.iter_mut() {
            if let Some(found) = row.get_qualified(&self.meta.name, column) {
                *value = found.clone();
            }
        }
        self.initialized = true;
    }

    /// Read the row by key. Returns `false` when the store has no such row.
    pub fn load(&mut self, tx: &mut dyn StoreTransaction) -> Result<bool> {
        let rows = tx.query(&self.key_criteria())?;
        let Some(first) = rows.first() else {
            tracing::warn!(table = %self.meta.name, key = %self.key_string, "no row for record key");
            return Ok(false);
        };
        if rows.len() > 1 {
            tracing::warn!(
                table = %self.meta.name,
                key = %self.key_string,
                rows = rows.len(),
                "key matched more than one row, using the first"
            );
        }
        self.initialize(first);
        Ok(true)
    }

    /// Current value: the pending write when there is one, else the base value.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.pending
            .get(column)
            .or_else(|| self.attributes.get(column))
            .or_else(|| self.key.value(column))
    }

    /// Base value, ignoring pending writes.
    pub fn committed_value(&self, column: &str) -> Option<&Value> {
        self.attributes
            .get(column)
            .or_else(|| self.key.value(column))
    }

    /// Record a write in the overlay.
    ///
    /// Writing the base value back drops the overlay entry.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let Some(base) = self.attributes.get(column) else {
            let kind = if self.key.value(column).is_some() {
                SchemaErrorKind::Invalid
            } else {
                SchemaErrorKind::ColumnNotFound
            };
            return Err(Error::schema(
                kind,
                format!("'{}' is not a writable column of '{}'", column, self.meta.name),
            ));
        };
        let value = value.into();
        if *base == value {
            self.pending.remove(column);
        } else {
            self.pending.insert(column.to_string(), value);
        }
        Ok(())
    }

    /// Pending writes, column to value.
    pub fn dirty_attributes(&self) -> &BTreeMap<String, Value> {
        &self.pending
    }

    /// Base attributes, column to value.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Predicates selecting exactly this record's row.
    pub fn key_criteria(&self) -> Criteria {
        Criteria::for_key(&self.key)
    }

    /// Write the overlay to the store inside the caller's transaction.
    ///
    /// With `force`, a clean record whose table carries a staleness marker
    /// still issues an update nulling the marker so the store re-stamps it.
    /// The overlay is left in place; call [`EntityRecord::apply_flushed`]
    /// once the transaction has committed.
    pub fn flush(&self, tx: &mut dyn StoreTransaction, force: bool) -> Result<u64> {
        let values = if self.pending.is_empty() {
            match self.staleness_column() {
                Some(marker) if force => BTreeMap::from([(marker.to_string(), Value::Null)]),
                _ => return Ok(0),
            }
        } else {
            self.pending.clone()
        };
        let affected = tx.update(&self.meta.name, &values, &self.key_criteria())?;
        if affected == 0 {
            tracing::warn!(table = %self.meta.name, key = %self.key_string, "update matched no row");
        }
        Ok(affected)
    }

    /// Fold the overlay into the base attributes after a successful flush.
    pub fn apply_flushed(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.attributes.extend(pending);
    }

    /// Discard pending writes.
    pub fn cancel(&mut self) {
        self.pending.clear();
    }

    /// Forget every value; the next read goes back to the store.
    pub fn unload(&mut self) {
        for value in self.attributes.values_mut() {
            *value = Value::Null;
        }
        self.pending.clear();
        self.initialized = false;
    }

    /// Delete the row inside the caller's transaction.
    pub fn delete(&self, tx: &mut dyn StoreTransaction) -> Result<u64> {
        tx.delete(&self.meta.name, &self.key_criteria())
    }

    pub fn to_snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            table: self.meta.name.clone(),
            key: self.key.clone(),
            attributes: self.attributes.clone(),
            pending: self.pending.clone(),
            initialized: self.initialized,
        }
    }

    /// Rebuild a record from a snapshot. Columns the table no longer has are dropped.
    pub fn from_snapshot(meta: Arc<TableMeta>, snapshot: &RecordSnapshot) -> Result<Self> {
        if snapshot.table != meta.name {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "snapshot of '{}' cannot be restored into '{}'",
                    snapshot.table, meta.name
                ),
            ));
        }
        let mut record = Self::new(meta, snapshot.key.clone());
        for (column, value) in &snapshot.attributes {
            if let Some(slot) = record.attributes.get_mut(column) {
                *slot = value.clone();
            }
        }
        for (column, value) in &snapshot.pending {
            if record.attributes.contains_key(column) {
                record.pending.insert(column.clone(), value.clone());
            }
        }
        record.initialized = snapshot.initialized;
        Ok(record)
    }
}
