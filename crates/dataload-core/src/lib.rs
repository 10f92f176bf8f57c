//! Dataload Core - Database boundary used by the import engine
//!
//! This crate provides the fundamental traits and types that the engine and
//! the drivers share. It defines:
//!
//! - `DatabaseDriver` - Trait for database driver implementations
//! - `Connection` - Trait for database connections (parameterized DML, commit/rollback)
//! - `SavepointSupport` - Savepoints inside a transaction
//! - `SchemaIntrospection` - Catalog lookup of columns, keys and foreign keys
//! - `DialectProfile` - Per-dialect quoting and error classification data
//! - Common types like `Value`, `Row`, `QueryResult`

mod connection;
pub mod dialects;
mod driver;
mod error;
mod schema;
pub mod transaction;
mod types;

pub use connection::*;
pub use dialects::{
    DIALECT_REGISTRY, DialectProfile, DialectRegistry, GENERIC_PROFILE, dialect_profile_or_generic,
    get_dialect_profile,
};
pub use driver::*;
pub use error::*;
pub use schema::*;
pub use transaction::*;
pub use types::*;
