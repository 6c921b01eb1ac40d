//! Configuration repository.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::models::Config;

/// Repository for key-value configuration.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration value.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let raw: Option<(String, String)> = conn
            .query_row(
                "SELECT key, value FROM config WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match raw {
            Some((key, value)) => Ok(Some(Config {
                key,
                value: serde_json::from_str(&value)?,
            })),
            None => Ok(None),
        }
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Read a typed value, `None` if the key is absent.
    pub fn get_typed<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
        match Self::get(conn, key)? {
            Some(config) => Ok(Some(serde_json::from_value(config.value)?)),
            None => Ok(None),
        }
    }

    /// Store a typed value.
    pub fn set_typed<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
        Self::set(conn, key, &serde_json::to_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn set_get_update() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "key", &json!("original")).unwrap();
        ConfigRepo::set(&conn, "key", &json!("updated")).unwrap();

        let config = ConfigRepo::get(&conn, "key").unwrap().unwrap();
        assert_eq!(config.key, "key");
        assert_eq!(config.value, json!("updated"));
        assert!(ConfigRepo::get(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn delete_value() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "gone", &json!(1)).unwrap();

        assert!(ConfigRepo::delete(&conn, "gone").unwrap());
        assert!(!ConfigRepo::delete(&conn, "gone").unwrap());
    }

    #[test]
    fn typed_round_trip() {
        let conn = setup_db();

        let missing: Option<Vec<u32>> = ConfigRepo::get_typed(&conn, "list").unwrap();
        assert!(missing.is_none());

        ConfigRepo::set_typed(&conn, "list", &vec![3u32, 1, 2]).unwrap();
        let list: Option<Vec<u32>> = ConfigRepo::get_typed(&conn, "list").unwrap();
        assert_eq!(list, Some(vec![3, 1, 2]));
    }

    #[test]
    fn typed_read_reports_shape_mismatch() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "n", &json!("not a number")).unwrap();

        let result: Result<Option<u32>> = ConfigRepo::get_typed(&conn, "n");
        assert!(result.is_err());
    }
}
