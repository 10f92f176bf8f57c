//! Transaction-related types and traits
//!
//! Transactions themselves are driven through [`crate::Connection`]; this
//! module adds savepoint support on top.

mod savepoint;

pub use savepoint::*;
