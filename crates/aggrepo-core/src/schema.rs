//! Table metadata and the provider contract.
//!
//! The cache engine only needs three facts about a table: its columns, which
//! of them form the primary key, and which column (if any) carries the
//! staleness marker the store refreshes on every write.

use std::collections::HashMap;
use std::sync::Arc;

/// Metadata about a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name as the store knows it
    pub name: String,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the store generates this column on insert
    pub auto_increment: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            auto_increment: false,
        }
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }
}

/// Metadata about a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Column the store re-stamps on every write (`None` disables staleness checks)
    pub staleness_column: Option<String>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            staleness_column: None,
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnMeta) -> Self {
        self.columns.push(column);
        self
    }

    /// Shorthand for a primary-key column.
    pub fn key(self, name: impl Into<String>) -> Self {
        self.column(ColumnMeta::new(name).primary_key(true))
    }

    /// Shorthand for a store-generated primary-key column.
    pub fn auto_key(self, name: impl Into<String>) -> Self {
        self.column(ColumnMeta::new(name).primary_key(true).auto_increment(true))
    }

    /// Shorthand for a plain attribute column.
    pub fn attribute(self, name: impl Into<String>) -> Self {
        self.column(ColumnMeta::new(name))
    }

    /// Declare the staleness-marker column, adding it as an attribute when absent.
    pub fn staleness_column(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.has_column(&name) {
            self.columns.push(ColumnMeta::new(name.clone()));
        }
        self.staleness_column = Some(name);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_meta(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key columns, in declaration order.
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }

    /// Every non-key column.
    pub fn attribute_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| !c.primary_key)
            .map(|c| c.name.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// The single store-generated key column, if the table has one.
    pub fn auto_increment_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.primary_key && c.auto_increment)
            .map(|c| c.name.as_str())
    }
}

/// Source of table metadata.
pub trait SchemaProvider: Send + Sync {
    /// Look up a table by name. `None` means the table is unknown.
    fn table(&self, name: &str) -> Option<Arc<TableMeta>>;
}

/// In-process schema provider backed by a map.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    tables: HashMap<String, Arc<TableMeta>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_table(mut self, table: TableMeta) -> Self {
        self.insert(table);
        self
    }

    /// Register or replace a table.
    pub fn insert(&mut self, table: TableMeta) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl SchemaProvider for SchemaMap {
    fn table(&self, name: &str) -> Option<Arc<TableMeta>> {
        self.tables.get(name).cloned()
    }
}
