//! Criteria and the store contract for aggrepo.
//!
//! `aggrepo-query` is the **query description layer**. It never talks to a
//! store itself; it describes what to fetch and defines the narrow contract a
//! store driver implements.
//!
//! # Role In The Architecture
//!
//! - **Criteria**: `Criteria` collects predicates keyed by `table.column`,
//!   joins, ordering and paging, and renders a deterministic fingerprint used
//!   to memoize query results per thread.
//! - **Store contract**: `Store` / `StoreTransaction` are the synchronous
//!   request/response seam every driver implements; `unit_of_work` wraps a
//!   closure in begin/commit/rollback.
//! - **Paging**: `Page` carries one page of results plus totals.
//!
//! The session layer (`aggrepo-session`) builds criteria from key and relation
//! metadata and runs them through a `Store`.

pub mod clause;
pub mod criteria;
pub mod join;
pub mod page;
pub mod store;

pub use clause::{OrderBy, OrderDirection, SelectModifier};
pub use criteria::{Comparison, Conjunction, Criteria, Criterion};
pub use join::Join;
pub use page::Page;
pub use store::{Store, StoreTransaction, unit_of_work};
