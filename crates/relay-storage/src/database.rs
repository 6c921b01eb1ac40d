//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use relay_core::{Account, Credential, RoutingConfig};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;
use crate::repository::{AccountRepo, ConfigRepo};

/// Config key holding the serialized [`RoutingConfig`].
pub const ROUTING_CONFIG_KEY: &str = "routing";

/// High-level database interface for Relay.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Open the database at a specific path, creating parent directories.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Root of Relay's application data (database, CA, profiles, logs).
    pub fn default_data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "relay", "Relay")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::default_data_dir()?.join("relay.db"))
    }

    // === Accounts ===

    pub fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let conn = self.pool.get()?;
        AccountRepo::get_by_id(&conn, id)
    }

    /// Accounts in creation order, optionally for one provider.
    pub fn list_accounts(&self, provider_id: Option<&str>) -> Result<Vec<Account>> {
        let conn = self.pool.get()?;
        AccountRepo::list(&conn, provider_id)
    }

    pub fn upsert_account(&self, account: &Account) -> Result<()> {
        let conn = self.pool.get()?;
        AccountRepo::upsert(&conn, account)
    }

    pub fn delete_account(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        AccountRepo::delete(&conn, id)
    }

    /// Store a freshly captured credential.
    ///
    /// An existing account for the same provider and email keeps its id and
    /// position and only gets the new credential.
    pub fn save_captured_account(
        &self,
        provider_id: &str,
        email: &str,
        credential: Credential,
    ) -> Result<Account> {
        let conn = self.pool.get()?;
        let account = match AccountRepo::get_by_identity(&conn, provider_id, email)? {
            Some(existing) => existing.with_credential(credential),
            None => Account::new(provider_id, email, credential),
        };
        AccountRepo::upsert(&conn, &account)?;

        info!(account = %account.id, provider = %account.provider_id, "Saved captured account");
        Ok(account)
    }

    // === Config ===

    /// Routing configuration, or the default when none was saved.
    pub fn routing_config(&self) -> Result<RoutingConfig> {
        let conn = self.pool.get()?;
        Ok(ConfigRepo::get_typed(&conn, ROUTING_CONFIG_KEY)?.unwrap_or_default())
    }

    pub fn set_routing_config(&self, routing: &RoutingConfig) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set_typed(&conn, ROUTING_CONFIG_KEY, routing)
    }

    pub fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.pool.get()?;
        Ok(ConfigRepo::get(&conn, key)?.map(|c| c.value))
    }

    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set(&conn, key, value)
    }
}
