//! Core types for aggrepo.
//!
//! This crate provides the foundational vocabulary shared by every other crate
//! in the workspace:
//!
//! - `Value` for dynamically-typed column values
//! - `Row` for result rows with shared column metadata
//! - `IdentityKey` for the stable, renderable identity of a record or aggregate
//! - `TableMeta` / `SchemaProvider` for table metadata discovery
//! - `Clock` for injectable time (aging is always computed against a clock)
//! - `Error` / `Result` for the workspace-wide error taxonomy

pub mod clock;
pub mod error;
pub mod key;
pub mod row;
pub mod schema;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    ConfigError, Error, KeyError, Result, SchemaError, SchemaErrorKind, StoreError,
    StoreErrorKind,
};
pub use key::{IdentityKey, KeyPart};
pub use row::{ColumnInfo, Row};
pub use schema::{ColumnMeta, SchemaMap, SchemaProvider, TableMeta};
pub use value::Value;
