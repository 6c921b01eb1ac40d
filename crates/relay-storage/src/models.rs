//! Row types that have no counterpart in `relay-core`.

use serde::{Deserialize, Serialize};

/// A configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration key.
    pub key: String,
    /// Configuration value (JSON).
    pub value: serde_json::Value,
}
