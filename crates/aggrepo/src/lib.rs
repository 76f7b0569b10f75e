//! aggrepo - cached, lifecycle-managed aggregates over a relational store.
//!
//! An aggregate is a root row plus the child rows it owns. aggrepo keeps one
//! shared instance per aggregate identity, tracks whether it is new, loaded,
//! dirty or unloaded, memoizes query results per thread, and ages idle
//! aggregates out in the background.
//!
//! - Explicit `PersistenceContext`: one store, one schema, one repository per
//!   registered aggregate type
//! - Identity map with staleness checks against a store-stamped marker column
//! - Criteria builder with a stable fingerprint for memoization
//! - `Reconciler` thread that commits or cancels idle dirty aggregates,
//!   unloads idle loaded ones and evicts idle empty ones
//! - Serializable snapshots
//!
//! # Quick Start
//!
//! ```
//! use aggrepo::prelude::*;
//! use std::sync::Arc;
//!
//! let schema = SchemaMap::new()
//!     .with_table(
//!         TableMeta::new("post")
//!             .auto_key("id")
//!             .attribute("title")
//!             .staleness_column("modified"),
//!     )
//!     .with_table(TableMeta::new("comment").auto_key("id").attribute("post_id"));
//! let store = Arc::new(MemoryStore::from_schema(&schema));
//! let id = store
//!     .insert_row("post", [("title", Value::from("Hello"))])
//!     .unwrap()
//!     .unwrap();
//!
//! let context = PersistenceContext::builder()
//!     .store(store.clone())
//!     .schema(Arc::new(schema))
//!     .register(AggregateBlueprint::new("blog", "post").relation("comment", ["id"], ["post_id"]))
//!     .build()
//!     .unwrap();
//!
//! let posts = context.repository("blog").unwrap();
//! let post = posts.find_by_id(id, None).unwrap().unwrap();
//! assert_eq!(post.state(), AggregateState::Loaded);
//!
//! post.set_root_value("title", "Edited").unwrap();
//! assert_eq!(post.state(), AggregateState::Dirty);
//! post.commit().unwrap();
//! assert_eq!(post.state(), AggregateState::Loaded);
//! ```

pub use aggrepo_core::{
    Clock, ColumnInfo, ColumnMeta, ConfigError, Error, IdentityKey, KeyError, KeyPart,
    ManualClock, Result, Row, SchemaError, SchemaErrorKind, SchemaMap, SchemaProvider,
    StoreError, StoreErrorKind, SystemClock, TableMeta, Value,
};

pub use aggrepo_query::{
    Comparison, Conjunction, Criteria, Criterion, Join, OrderBy, OrderDirection, Page,
    SelectModifier, Store, StoreTransaction, unit_of_work,
};

pub use aggrepo_session::{
    Aggregate, AggregateBlueprint, AggregateResolver, AggregateSnapshot, AggregateState,
    AlwaysSweep, ContextBuilder, ContextConfig, DirtyAttributes, EntityRecord, GcPolicy,
    GcReport, IdentityMap, MemoryGate, PersistenceContext, Reconciler, RecordSnapshot,
    Relation, Repository, ResidentMemoryGate, TypeRegistry, rehydrate, row_key,
};

#[cfg(feature = "memory")]
pub use aggrepo_memory::{MemoryStore, Operation, StoreStats};

/// Configuration defaults.
pub mod defaults {
    pub use aggrepo_session::config::{
        DEFAULT_DIRTY_AGE, DEFAULT_GC_INTERVAL, DEFAULT_LOADED_AGE, DEFAULT_MEMORY_PAGE_SIZE,
        DEFAULT_NEW_AGE, DEFAULT_SELECT_ALL_LIMIT, DEFAULT_THREAD_SESSION_LIFETIME, MIN_GC_INTERVAL,
    };
}

/// Everything an application typically needs.
pub mod prelude {
    pub use crate::{
        // Aggregates
        Aggregate,
        AggregateBlueprint,
        AggregateSnapshot,
        AggregateState,
        // Context
        ContextConfig,
        // Query building
        Criteria,
        Error,
        IdentityKey,
        OrderBy,
        PersistenceContext,
        Reconciler,
        Repository,
        Result,
        Row,
        // Schema
        SchemaMap,
        TableMeta,
        Value,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;
}
