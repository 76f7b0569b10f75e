//! Aggregate lifecycle and repository cache for aggrepo.
//!
//! `aggrepo-session` is the **caching layer**. It presents store-backed
//! aggregates (a root row plus the child rows it owns) as long-lived shared
//! objects, keeps at most one live instance per identity, and ages them out
//! in the background.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one `Arc<Aggregate>` per rendered root key, per repository.
//! - **Lifecycle**: `NEW`, `LOADED`, `DIRTY`, `UNLOADED`, derived from the records.
//! - **Thread sessions**: each thread memoizes query results by criteria
//!   fingerprint; entries are validated against the identity map on read.
//! - **Reconciliation**: sweeps commit or cancel idle dirty aggregates, unload
//!   idle loaded ones and evict idle empty ones.
//!
//! # Design Philosophy
//!
//! - **Explicit context**: a `PersistenceContext` is built once and passed
//!   around; there is no global registry.
//! - **Clock injection**: ages are measured against a `Clock`, so sweeps can be
//!   driven by a `ManualClock` in tests.
//! - **No I/O under the repository lock**: sweeps snapshot the container and
//!   act outside it.
//!
//! # Example
//!
//! ```ignore
//! let context = PersistenceContext::builder()
//!     .store(Arc::new(store))
//!     .schema(Arc::new(schema))
//!     .register(AggregateBlueprint::new("blog", "post").relation("comment", ["id"], ["post_id"]))
//!     .build()?;
//!
//! let posts = context.repository("blog").expect("registered");
//! let post = posts.find_by_id(1_i64, None)?.expect("exists");
//! post.set_root_value("title", "Edited")?;
//! post.commit()?;
//!
//! let _reconciler = Reconciler::spawn(&context)?;
//! ```

pub mod aggregate;
pub mod config;
pub mod context;
pub mod identity_map;
pub mod memory;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod snapshot;
pub mod thread_session;

pub use aggregate::{Aggregate, AggregateState, DirtyAttributes};
pub use config::{ContextConfig, GcPolicy};
pub use context::{Backend, ContextBuilder, PersistenceContext};
pub use identity_map::IdentityMap;
pub use memory::{AlwaysSweep, MemoryGate, ResidentMemoryGate};
pub use reconcile::Reconciler;
pub use record::{EntityRecord, row_key};
pub use registry::{AggregateBlueprint, Relation, TypeRegistry};
pub use repository::{GcReport, Repository};
pub use resolver::AggregateResolver;
pub use snapshot::{AggregateSnapshot, RecordSnapshot, rehydrate};
pub use thread_session::{ThreadSession, ThreadSessions};
