//! Turning store rows into cached aggregates.

use crate::aggregate::Aggregate;
use crate::record::row_key;
use crate::repository::Repository;
use aggrepo_core::{Result, Row, Value};
use aggrepo_query::{Criteria, unit_of_work};
use std::cmp::Ordering;
use std::sync::Arc;

/// Resolves root rows to aggregates through one repository.
///
/// A cached aggregate is reused unless the row's staleness marker says the
/// store has moved on since the aggregate was read.
#[derive(Debug, Clone, Copy)]
pub struct AggregateResolver<'a> {
    repository: &'a Repository,
}

impl<'a> AggregateResolver<'a> {
    pub fn new(repository: &'a Repository) -> Self {
        Self { repository }
    }

    /// Resolve one root row. `None` when the row lacks a complete key.
    #[tracing::instrument(level = "trace", skip_all, fields(aggregate = self.repository.name()))]
    pub fn resolve(&self, row: &Row) -> Result<Option<Arc<Aggregate>>> {
        let meta = self.repository.root_meta()?;
        let Some(key) = row_key(&meta, row) else {
            tracing::trace!("row has no complete root key");
            return Ok(None);
        };
        let key_string = key.render();
        let row_marker = meta
            .staleness_column
            .as_deref()
            .and_then(|column| row.get_qualified(&meta.name, column))
            .filter(|marker| !marker.is_null())
            .cloned();

        if let Some(cached) = self.repository.get(&key_string) {
            let recorded = self.repository.marker(&key_string);
            if !is_stale(recorded.as_ref(), row_marker.as_ref()) {
                cached.touch();
                tracing::trace!(key = %key_string, "cache hit");
                return Ok(Some(cached));
            }
            if cached.is_dirty() {
                tracing::warn!(
                    aggregate = self.repository.name(),
                    key = %key_string,
                    dirty = ?cached.dirty_attributes(),
                    "store row is newer, discarding pending changes of cached aggregate"
                );
            } else {
                tracing::debug!(key = %key_string, recorded = ?recorded, row = ?row_marker, "cached aggregate is stale");
            }
            self.repository.remove_instance(&cached);
        }

        let aggregate = Arc::new(self.repository.new_aggregate(key));
        aggregate.populate_root(row)?;
        aggregate.load_children()?;
        let aggregate = self.repository.add(aggregate);
        if let Some(marker) = row_marker {
            self.repository.record_marker(&key_string, marker);
        }
        Ok(Some(aggregate))
    }

    /// Resolve rows in order, skipping rows without a key.
    ///
    /// The first failure aborts with its error.
    pub fn resolve_all(&self, rows: &[Row]) -> Result<Vec<Arc<Aggregate>>> {
        let mut aggregates = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(aggregate) = self.resolve(row)? {
                aggregates.push(aggregate);
            }
        }
        Ok(aggregates)
    }

    /// Run `criteria` against the root table, memoized per thread.
    pub fn find_by_criteria(&self, criteria: &Criteria) -> Result<Vec<Arc<Aggregate>>> {
        let criteria = criteria
            .clone()
            .select_from(self.repository.blueprint().root_table())
            .distinct();
        let fingerprint = criteria.fingerprint();

        if let Some(aggregates) = self.repository.get_thread_session_query_result(&fingerprint) {
            tracing::trace!(fingerprint = %fingerprint, "memoized result");
            return Ok(aggregates);
        }

        let rows = unit_of_work(self.repository.store(), "resolver.find", |tx| {
            tx.query(&criteria)
        })?;
        let aggregates = self.resolve_all(&rows)?;
        self.repository
            .add_thread_session_query_result(&fingerprint, &aggregates);
        tracing::debug!(
            aggregate = self.repository.name(),
            rows = rows.len(),
            resolved = aggregates.len(),
            "query resolved"
        );
        Ok(aggregates)
    }
}

/// Whether a row marker means the cached copy must be replaced.
///
/// No row marker: nothing to compare, keep. No recorded marker, a strictly
/// newer row marker, or markers that do not compare: replace.
pub(crate) fn is_stale(recorded: Option<&Value>, row: Option<&Value>) -> bool {
    let Some(row) = row else {
        return false;
    };
    let Some(recorded) = recorded else {
        return true;
    };
    !matches!(row.compare(recorded), Some(Ordering::Equal | Ordering::Less))
}
