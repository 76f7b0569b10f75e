//! Predicate evaluation over in-memory rows.

use aggrepo_core::{Error, Result, StoreErrorKind, Value};
use aggrepo_query::clause::split_column;
use aggrepo_query::{Comparison, Conjunction, Criterion, Join};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub(crate) type RowMap = BTreeMap<String, Value>;

/// One candidate row per table taking part in a select.
pub(crate) struct Binding<'a> {
    target: &'a str,
    rows: Vec<(&'a str, &'a RowMap)>,
}

impl<'a> Binding<'a> {
    pub(crate) fn new(target: &'a str, row: &'a RowMap) -> Self {
        Self {
            target,
            rows: vec![(target, row)],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn push(&mut self, table: &'a str, row: &'a RowMap) {
        self.rows.push((table, row));
    }

    pub(crate) fn pop(&mut self) {
        self.rows.pop();
    }

    /// Resolve `column` of `table` (the target table when `None`).
    pub(crate) fn lookup(&self, table: Option<&str>, column: &str) -> Result<&'a Value> {
        let table = table.unwrap_or(self.target);
        let row: &'a RowMap = self
            .rows
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, row)| *row)
            .ok_or_else(|| query_error(format!("table '{}' is not part of the select", table)))?;
        row.get(column)
            .ok_or_else(|| query_error(format!("no column '{}' on '{}'", column, table)))
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Result<&'a Value> {
        let (table, column) = split_column(name);
        self.lookup(table, column)
    }
}

pub(crate) fn query_error(message: impl Into<String>) -> Error {
    Error::store(StoreErrorKind::Query, message)
}

/// Evaluate a predicate and its chained clauses left to right.
pub(crate) fn criterion_holds(
    criterion: &Criterion,
    binding: &Binding<'_>,
    ignore_case: bool,
) -> Result<bool> {
    let actual = binding.lookup(Some(&criterion.table), &criterion.column)?;
    let mut result = compare(actual, criterion.comparison, &criterion.value, ignore_case)?;
    for (conjunction, clause) in criterion.clauses() {
        let next = criterion_holds(clause, binding, ignore_case)?;
        result = match conjunction {
            Conjunction::And => result && next,
            Conjunction::Or => result || next,
        };
    }
    Ok(result)
}

pub(crate) fn join_holds(join: &Join, binding: &Binding<'_>) -> Result<bool> {
    let left = binding.lookup_name(&join.left)?;
    let right = binding.lookup_name(&join.right)?;
    Ok(left.loose_eq(right))
}

fn compare(actual: &Value, comparison: Comparison, expected: &Value, ignore_case: bool) -> Result<bool> {
    let equal = |a: &Value, b: &Value| match (a, b) {
        (Value::Text(x), Value::Text(y)) if ignore_case => x.to_lowercase() == y.to_lowercase(),
        _ => a.loose_eq(b),
    };
    let ordering = || match (actual, expected) {
        (Value::Text(x), Value::Text(y)) if ignore_case => {
            Some(x.to_lowercase().cmp(&y.to_lowercase()))
        }
        _ => actual.compare(expected),
    };

    Ok(match comparison {
        Comparison::IsNull => actual.is_null(),
        Comparison::IsNotNull => !actual.is_null(),
        _ if actual.is_null() => false,
        Comparison::Equal => equal(actual, expected),
        Comparison::NotEqual => !expected.is_null() && !equal(actual, expected),
        Comparison::GreaterThan => ordering() == Some(Ordering::Greater),
        Comparison::LessThan => ordering() == Some(Ordering::Less),
        Comparison::GreaterEqual => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        Comparison::LessEqual => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        Comparison::Like | Comparison::NotLike => {
            let (Value::Text(text), Value::Text(pattern)) = (actual, expected) else {
                return Err(query_error(format!(
                    "{} needs text operands, got {} and {}",
                    comparison.as_str(),
                    actual.type_name(),
                    expected.type_name()
                )));
            };
            let matched = like_regex(pattern, ignore_case)?.is_match(text);
            matched == (comparison == Comparison::Like)
        }
        Comparison::In | Comparison::NotIn => {
            let Value::Array(candidates) = expected else {
                return Err(query_error(format!(
                    "{} needs an array operand, got {}",
                    comparison.as_str(),
                    expected.type_name()
                )));
            };
            let found = candidates.iter().any(|c| equal(actual, c));
            found == (comparison == Comparison::In)
        }
    })
}

/// Translate a SQL `LIKE` pattern (`%`, `_`, `\` escape) to an anchored regex.
pub(crate) fn like_regex(pattern: &str, ignore_case: bool) -> Result<Regex> {
    let mut out = String::from(if ignore_case { "(?is)^" } else { "(?s)^" });
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| query_error(format!("bad LIKE pattern '{}': {}", pattern, e)))
}
