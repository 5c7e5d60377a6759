//! # rascal-adapter-storage-sqlite-sqlx
//!
//! `SQLite` persistence adapter using [sqlx](https://docs.rs/sqlx).
//!
//! ## Responsibilities
//! - Implement the `HistoryStore` port defined in `rascal-app::ports`
//! - Manage `SQLite` connection pool lifecycle
//! - Run database migrations (using sqlx embedded migrations)
//! - Map latency histories to and from their JSON columns
//!
//! ## Dependency rule
//! Depends on `rascal-app` (for port traits) and `rascal-domain` (for domain types).
//! The `app` and `domain` crates must never reference this adapter.

pub mod error;
pub mod history_store;
pub mod pool;

pub use error::StorageError;
pub use history_store::SqliteHistoryStore;
pub use pool::{Config, Database};
