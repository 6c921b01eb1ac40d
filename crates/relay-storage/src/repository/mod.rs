//! Database repositories for each table.

pub mod accounts;
pub mod config;

pub use accounts::AccountRepo;
pub use config::ConfigRepo;
