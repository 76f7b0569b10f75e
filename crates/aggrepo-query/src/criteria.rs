//! Query criteria and fingerprints.
//!
//! A [`Criteria`] describes a select over one target table: predicates keyed by
//! `table.column` (adding a predicate for the same column replaces the old
//! one), joins, ordering, grouping, paging and a few flags. Its
//! [`Criteria::fingerprint`] is a deterministic string over every field and is
//! the memo key for per-thread query results.

use crate::clause::{OrderBy, SelectModifier};
use crate::join::Join;
use aggrepo_core::{IdentityKey, Value};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;

/// Comparison operator of a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Comparison {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Comparison::Equal => "=",
            Comparison::NotEqual => "<>",
            Comparison::GreaterThan => ">",
            Comparison::LessThan => "<",
            Comparison::GreaterEqual => ">=",
            Comparison::LessEqual => "<=",
            Comparison::Like => "LIKE",
            Comparison::NotLike => "NOT LIKE",
            Comparison::In => "IN",
            Comparison::NotIn => "NOT IN",
            Comparison::IsNull => "IS NULL",
            Comparison::IsNotNull => "IS NOT NULL",
        }
    }
}

/// How a chained clause combines with the predicate it hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Conjunction::And => "AND",
            Conjunction::Or => "OR",
        }
    }
}

/// A single predicate, optionally with chained `AND`/`OR` clauses.
///
/// Chained clauses are evaluated left to right:
/// `a OR b AND c` means `(a OR b) AND c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub table: String,
    pub column: String,
    pub comparison: Comparison,
    pub value: Value,
    clauses: Vec<(Conjunction, Criterion)>,
}

impl Criterion {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        comparison: Comparison,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            comparison,
            value: value.into(),
            clauses: Vec::new(),
        }
    }

    /// `table.column = value`
    pub fn eq(table: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(table, column, Comparison::Equal, value)
    }

    /// `table.column IN (values)`
    pub fn is_in(table: impl Into<String>, column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(table, column, Comparison::In, Value::Array(values))
    }

    /// Chain `AND other`.
    pub fn and(mut self, other: Criterion) -> Self {
        self.clauses.push((Conjunction::And, other));
        self
    }

    /// Chain `OR other`.
    pub fn or(mut self, other: Criterion) -> Self {
        self.clauses.push((Conjunction::Or, other));
        self
    }

    /// The `table.column` name this predicate is keyed by.
    pub fn key(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }

    pub fn clauses(&self) -> &[(Conjunction, Criterion)] {
        &self.clauses
    }

    /// Deterministic rendering of this predicate and its chained clauses.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_json().to_string()
    }

    /// Canonical JSON form; text components are always quoted strings.
    fn fingerprint_json(&self) -> JsonValue {
        let clauses: Vec<JsonValue> = self
            .clauses
            .iter()
            .map(|(conjunction, clause)| json!([conjunction.as_str(), clause.fingerprint_json()]))
            .collect();
        json!({
            "table": self.table,
            "column": self.column,
            "op": self.comparison.as_str(),
            "value": value_json(&self.value),
            "clauses": clauses,
        })
    }
}

/// Tagged JSON of a value; the tag keeps `1` and `"1"` apart.
fn value_json(value: &Value) -> JsonValue {
    match value {
        Value::Array(items) => JsonValue::Array(items.iter().map(value_json).collect()),
        other => json!([other.type_name(), other.to_string()]),
    }
}

/// Everything needed to select rows from one target table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    select_from: Option<String>,
    db_name: Option<String>,
    criteria: BTreeMap<String, Criterion>,
    joins: Vec<Join>,
    order_by: Vec<OrderBy>,
    group_by: Vec<String>,
    having: Option<Criterion>,
    select_columns: Vec<String>,
    modifiers: Vec<SelectModifier>,
    limit: Option<u64>,
    offset: Option<u64>,
    ignore_case: bool,
    single_record: bool,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicates matching exactly the row named by `key`.
    pub fn for_key(key: &IdentityKey) -> Self {
        let mut criteria = Self::new().select_from(key.table());
        for part in key.parts() {
            criteria.insert(Criterion::eq(&part.table, &part.column, part.value.clone()));
        }
        criteria
    }

    // ==================== Builders ====================

    /// Set the table rows are selected from.
    pub fn select_from(mut self, table: impl Into<String>) -> Self {
        self.select_from = Some(table.into());
        self
    }

    pub fn db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = Some(name.into());
        self
    }

    /// Add a predicate, replacing any existing predicate on the same column.
    pub fn add(mut self, criterion: Criterion) -> Self {
        self.insert(criterion);
        self
    }

    /// Shorthand for `add(Criterion::eq(..))`.
    pub fn eq(self, table: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add(Criterion::eq(table, column, value))
    }

    /// Shorthand for `add(Criterion::new(..))`.
    pub fn filter(
        self,
        table: impl Into<String>,
        column: impl Into<String>,
        comparison: Comparison,
        value: impl Into<Value>,
    ) -> Self {
        self.add(Criterion::new(table, column, comparison, value))
    }

    pub fn add_in(self, table: impl Into<String>, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.add(Criterion::is_in(table, column, values))
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn joins_with(mut self, joins: impl IntoIterator<Item = Join>) -> Self {
        self.joins.extend(joins);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn asc(self, column: impl Into<String>) -> Self {
        self.order_by(OrderBy::asc(column))
    }

    pub fn desc(self, column: impl Into<String>) -> Self {
        self.order_by(OrderBy::desc(column))
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    pub fn having(mut self, criterion: Criterion) -> Self {
        self.having = Some(criterion);
        self
    }

    pub fn select_column(mut self, column: impl Into<String>) -> Self {
        self.select_columns.push(column.into());
        self
    }

    /// Add `DISTINCT` unless already present.
    pub fn distinct(self) -> Self {
        self.modifier(SelectModifier::Distinct)
    }

    pub fn modifier(mut self, modifier: SelectModifier) -> Self {
        if !self.modifiers.contains(&modifier) {
            self.modifiers.push(modifier);
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn ignore_case(mut self, value: bool) -> Self {
        self.ignore_case = value;
        self
    }

    pub fn single_record(mut self, value: bool) -> Self {
        self.single_record = value;
        self
    }

    /// In-place form of [`Criteria::add`].
    pub fn insert(&mut self, criterion: Criterion) {
        self.criteria.insert(criterion.key(), criterion);
    }

    /// Remove the predicate on `table.column`, returning it.
    pub fn remove(&mut self, key: &str) -> Option<Criterion> {
        self.criteria.remove(key)
    }

    /// Drop limit and offset, keeping everything else (used for totals).
    pub fn without_paging(mut self) -> Self {
        self.limit = None;
        self.offset = None;
        self
    }

    // ==================== Accessors ====================

    pub fn target(&self) -> Option<&str> {
        self.select_from.as_deref()
    }

    pub fn database(&self) -> Option<&str> {
        self.db_name.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Criterion> {
        self.criteria.get(key)
    }

    /// Predicates in key order.
    pub fn criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.values()
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn grouping(&self) -> &[String] {
        &self.group_by
    }

    pub fn having_clause(&self) -> Option<&Criterion> {
        self.having.as_ref()
    }

    pub fn selected_columns(&self) -> &[String] {
        &self.select_columns
    }

    pub fn modifiers(&self) -> &[SelectModifier] {
        &self.modifiers
    }

    pub fn is_distinct(&self) -> bool {
        self.modifiers.contains(&SelectModifier::Distinct)
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    pub fn is_ignore_case(&self) -> bool {
        self.ignore_case
    }

    pub fn is_single_record(&self) -> bool {
        self.single_record
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Every table the criteria mentions: target, predicates and joins.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = Vec::new();
        if let Some(target) = self.select_from.as_deref() {
            push_unique(&mut tables, target);
        }
        for criterion in self.criteria.values() {
            push_unique(&mut tables, &criterion.table);
            for (_, clause) in &criterion.clauses {
                push_unique(&mut tables, &clause.table);
            }
        }
        for join in &self.joins {
            for table in join.tables() {
                push_unique(&mut tables, table);
            }
        }
        tables
    }

    /// Deterministic memo key.
    ///
    /// Predicates are kept sorted by key, joins and group-by columns are
    /// sorted here; ordering and selected columns keep their given order.
    /// Any change to a predicate, ordering, limit or offset changes the result.
    pub fn fingerprint(&self) -> String {
        let mut joins: Vec<String> = self.joins.iter().map(Join::to_sql).collect();
        joins.sort();
        let mut group_by = self.group_by.clone();
        group_by.sort();
        let mut modifiers: Vec<&str> = self.modifiers.iter().map(|m| m.as_str()).collect();
        modifiers.sort_unstable();
        let order_by: Vec<String> = self.order_by.iter().map(OrderBy::to_sql).collect();
        let predicates: Vec<JsonValue> = self
            .criteria
            .iter()
            .map(|(key, criterion)| json!([key, criterion.fingerprint_json()]))
            .collect();

        json!({
            "from": self.select_from,
            "db": self.db_name,
            "modifiers": modifiers,
            "columns": self.select_columns,
            "order": order_by,
            "group": group_by,
            "having": self.having.as_ref().map(Criterion::fingerprint_json),
            "limit": self.limit,
            "offset": self.offset,
            "ignore_case": self.ignore_case,
            "single": self.single_record,
            "joins": joins,
            "where": predicates,
        })
        .to_string()
    }
}

fn push_unique<'a>(tables: &mut Vec<&'a str>, table: &'a str) {
    if !tables.contains(&table) {
        tables.push(table);
    }
}
