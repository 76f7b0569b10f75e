//! In-memory store driver for aggrepo.
//!
//! This crate provides a `Store` implementation that keeps tables in process
//! memory. It evaluates the full criteria contract and is what the workspace
//! tests run against; it also works as an embeddable store for tools that do
//! not need durability.
//!
//! # Features
//!
//! - Predicates: `=`, `<>`, `<`, `<=`, `>`, `>=`, `LIKE`, `NOT LIKE`, `IN`,
//!   `NOT IN`, `IS NULL`, `IS NOT NULL`, chained `AND`/`OR`, ignore-case
//! - Joins evaluated as semi-joins against the target table
//! - Ordering, grouping, distinct, projection, limit and offset
//! - Transactions with rollback (explicit or on drop)
//! - Store-generated keys and an auto-stamped staleness-marker column
//! - Call statistics and failure injection for tests
//!
//! # Example
//!
//! ```rust
//! use aggrepo_core::{TableMeta, Value};
//! use aggrepo_memory::MemoryStore;
//! use aggrepo_query::{Criteria, unit_of_work};
//!
//! let store = MemoryStore::new();
//! store.create_table(TableMeta::new("users").auto_key("id").attribute("name"));
//! store.insert_row("users", [("name", Value::from("ann"))]).unwrap();
//!
//! let rows = unit_of_work(&store, "example", |tx| {
//!     tx.query(&Criteria::new().select_from("users").eq("users", "name", "ann"))
//! })
//! .unwrap();
//! assert_eq!(rows.len(), 1);
//! ```
//!
//! # Thread Safety
//!
//! `MemoryStore` is `Send` and `Sync`. A transaction holds the store's table
//! lock from `begin` until it commits, rolls back or is dropped, so
//! transactions are serialized.

mod eval;
pub mod store;

pub use store::{MemoryStore, MemoryTransaction, Operation, StoreStats};
