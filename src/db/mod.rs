//! Embedded store backend.
//!
//! Layout:
//! - `schema.rs`: SQL DDL and per-table column lists
//! - `sqlite.rs`: `SqliteStore`, the `RemoteStore` implementation with its change feed
//! - `policy.rs`: write authorization applied inside the store

pub mod policy;
pub mod schema;
pub mod sqlite;

pub use schema::SQLITE_INIT;
pub use sqlite::{SqlitePool, SqliteStore};
