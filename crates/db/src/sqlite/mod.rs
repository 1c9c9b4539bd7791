//! SQLite-Backend

pub mod envelopes;
pub mod groups;
pub mod pool;

pub use pool::SqliteDb;
