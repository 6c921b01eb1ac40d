//! Relay Storage - SQLite persistence layer.
//!
//! This crate stores:
//!
//! - Captured accounts (provider, identity, opaque credential)
//! - Configuration key-value pairs, including the routing configuration
//!
//! # Example
//!
//! ```no_run
//! use relay_core::Credential;
//! use relay_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.save_captured_account("kimi", "me@example.com", Credential::from_text("session=1"))
//!     .unwrap();
//! let routing = db.routing_config().unwrap();
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;
mod store;

pub use database::{Database, ROUTING_CONFIG_KEY};
pub use error::{Result, StorageError};
pub use models::Config;
pub use pool::ConnectionPool;
pub use repository::{AccountRepo, ConfigRepo};
pub use store::SqliteAccountStore;
