//! DML statement building
//!
//! The builder is a pure function of the dialect, the target table, the
//! mapped columns, the key columns and the constant columns. Dialect
//! differences for upsert and insert-ignore live in the strategy table.

mod builder;
mod outcome;
mod strategy;

pub use builder::*;
pub use outcome::*;
pub use strategy::*;
