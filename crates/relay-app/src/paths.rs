//! On-disk layout of the Relay data directory.

use std::path::{Path, PathBuf};

use relay_storage::Database;

/// Resolved data directory and the files Relay keeps in it.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Uses `data_dir` when given, otherwise the platform data directory.
    pub fn resolve(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        match data_dir {
            Some(root) => Ok(Self::new(root)),
            None => Ok(Self::new(Database::default_data_dir()?)),
        }
    }

    /// Root directory; the CA manager keeps `ca/` and `certs/` here.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("relay.db")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
