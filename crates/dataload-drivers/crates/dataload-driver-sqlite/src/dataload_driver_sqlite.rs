//! SQLite database driver implementation

mod connection;
mod driver;

pub use connection::{DEFAULT_BUSY_TIMEOUT_MS, SqliteCancelHandle, SqliteConnection, SqliteOpenOptions};
pub use driver::SqliteDriver;
