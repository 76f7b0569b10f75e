//! Store rows.
//!
//! A query returns rows that share one [`ColumnInfo`]; a row is just its
//! values plus that shared handle. Names are bare (`title`) or
//! table-qualified (`post.title`) depending on what the store projects.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered column names of one result set, with a name index.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Index `names`. A repeated name resolves to its first position.
    pub fn new(names: Vec<String>) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (position, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(position);
        }
        Self { names, positions }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One row of a result set.
///
/// [`Row::get_qualified`] resolves a column of a given table whichever
/// naming form the store used.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// A row with its own column index.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_columns(Arc::new(ColumnInfo::new(column_names)), values)
    }

    /// A row sharing the column index of its result set.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(names, values)
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the column spelled exactly `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.values.get(self.columns.index_of(name)?)
    }

    /// Value of `table.column`, falling back to the bare `column`.
    pub fn get_qualified(&self, table: &str, column: &str) -> Option<&Value> {
        self.get_by_name(&format!("{}.{}", table, column))
            .or_else(|| self.get_by_name(column))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// `(name, value)` in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_row() -> Row {
        Row::from_pairs([
            ("post.id", Value::BigInt(7)),
            ("title", Value::from("bare")),
            ("post.title", Value::from("qualified")),
            ("author", Value::from("ann")),
        ])
    }

    #[test]
    fn lookup_by_position_and_name() {
        let row = post_row();
        assert_eq!(row.len(), 4);
        assert_eq!(row.get(0), Some(&Value::BigInt(7)));
        assert_eq!(row.get(9), None);
        assert_eq!(row.get_by_name("author"), Some(&Value::from("ann")));
        assert_eq!(row.get_by_name("id"), None);
        assert!(row.contains_column("post.id"));
    }

    #[test]
    fn qualified_names_win_over_bare_ones() {
        let row = post_row();
        assert_eq!(row.get_qualified("post", "title"), Some(&Value::from("qualified")));
        assert_eq!(row.get_qualified("post", "id"), Some(&Value::BigInt(7)));
        assert_eq!(row.get_qualified("post", "author"), Some(&Value::from("ann")));
        assert_eq!(row.get_qualified("comment", "id"), None);
    }

    #[test]
    fn repeated_names_resolve_to_the_first_column() {
        let row = Row::new(
            vec!["id".into(), "id".into()],
            vec![Value::Int(1), Value::Int(2)],
        );
        assert_eq!(row.get_by_name("id"), Some(&Value::Int(1)));
    }

    #[test]
    fn result_sets_share_one_index() {
        let columns = Arc::new(ColumnInfo::new(vec!["id".into(), "body".into()]));
        let rows: Vec<Row> = (1..=3)
            .map(|i| Row::with_columns(Arc::clone(&columns), vec![Value::BigInt(i), Value::Null]))
            .collect();
        assert!(rows.iter().all(|r| Arc::ptr_eq(&r.column_info(), &columns)));
        assert_eq!(rows[2].get_by_name("id"), Some(&Value::BigInt(3)));

        let pairs: Vec<_> = rows[0].iter().collect();
        assert_eq!(pairs, vec![("id", &Value::BigInt(1)), ("body", &Value::Null)]);
        assert!(Row::new(vec![], vec![]).is_empty());
    }
}
