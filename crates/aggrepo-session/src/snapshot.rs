//! Aggregates as plain data.
//!
//! A snapshot carries records, overlays and flags but no context handle, so
//! it can be serialized, moved, and rehydrated into another context that
//! registers the same aggregate type.

use crate::aggregate::{Aggregate, Children};
use crate::context::PersistenceContext;
use crate::record::EntityRecord;
use crate::repository::Repository;
use aggrepo_core::{Error, IdentityKey, Result, SchemaErrorKind, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One record: base attributes, pending writes, and whether it was populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub table: String,
    pub key: IdentityKey,
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub pending: BTreeMap<String, Value>,
    pub initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Registered aggregate type name
    pub aggregate: String,
    pub key: IdentityKey,
    pub auto_commit: bool,
    pub cascade_on_delete: bool,
    pub root: Option<RecordSnapshot>,
    /// Child table to records
    #[serde(default)]
    pub children: BTreeMap<String, Vec<RecordSnapshot>>,
}

impl AggregateSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Rebuild a snapshot as a live aggregate cached in `context`.
pub fn rehydrate(snapshot: &AggregateSnapshot, context: &PersistenceContext) -> Result<Arc<Aggregate>> {
    let repository = context.repository(&snapshot.aggregate).ok_or_else(|| {
        Error::config(format!(
            "no aggregate type '{}' is registered",
            snapshot.aggregate
        ))
    })?;
    repository.restore(snapshot)
}

/// Build (but do not cache) the aggregate a snapshot describes.
pub(crate) fn rehydrate_into(repository: &Repository, snapshot: &AggregateSnapshot) -> Result<Aggregate> {
    let blueprint = repository.blueprint();
    if snapshot.aggregate != blueprint.name() {
        return Err(Error::config(format!(
            "snapshot of '{}' cannot be restored into '{}'",
            snapshot.aggregate,
            blueprint.name()
        )));
    }
    let root_meta = repository.root_meta()?;
    if snapshot.key.table() != root_meta.name {
        return Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!("snapshot key {} is not a '{}' key", snapshot.key, root_meta.name),
        ));
    }

    let root = snapshot
        .root
        .as_ref()
        .map(|record| EntityRecord::from_snapshot(root_meta, record))
        .transpose()?;

    let mut children = Children::new();
    for (table, records) in &snapshot.children {
        if !blueprint.has_child(table) {
            tracing::warn!(aggregate = blueprint.name(), child = %table, "snapshot child is not declared, dropped");
            continue;
        }
        let Some(meta) = repository.backend().schema.table(table) else {
            tracing::warn!(aggregate = blueprint.name(), child = %table, "snapshot child has no schema, dropped");
            continue;
        };
        let mut collection = BTreeMap::new();
        for record in records {
            let record = EntityRecord::from_snapshot(Arc::clone(&meta), record)?;
            collection.insert(record.key_string().to_string(), record);
        }
        children.insert(table.clone(), collection);
    }

    Ok(Aggregate::with_contents(
        Arc::clone(blueprint),
        Arc::clone(repository.backend()),
        repository.handle(),
        snapshot.key.clone(),
        root,
        children,
        snapshot.auto_commit,
        snapshot.cascade_on_delete,
    ))
}
