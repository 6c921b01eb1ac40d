//! Account repository.

use chrono::{DateTime, Utc};
use relay_core::{Account, Credential};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;

const COLUMNS: &str = "id, provider_id, email, credential, created_at, updated_at";

/// Repository for account operations.
pub struct AccountRepo;

impl AccountRepo {
    /// Insert an account, or replace the mutable fields of an existing id.
    pub fn upsert(conn: &Connection, account: &Account) -> Result<()> {
        let credential_json = serde_json::to_string(&account.credential)?;

        conn.execute(
            "INSERT INTO accounts (id, provider_id, email, credential, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                provider_id = ?2, email = ?3, credential = ?4, updated_at = ?6",
            params![
                account.id,
                account.provider_id,
                account.email,
                credential_json,
                account.created_at.to_rfc3339(),
                account.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get an account by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = ?1", COLUMNS);
        Ok(conn.query_row(&sql, [id], from_row).optional()?)
    }

    /// Get the account holding `email` at `provider_id`.
    pub fn get_by_identity(
        conn: &Connection,
        provider_id: &str,
        email: &str,
    ) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE provider_id = ?1 AND lower(email) = lower(?2)",
            COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![provider_id.to_lowercase(), email], from_row)
            .optional()?)
    }

    /// List accounts in creation order, optionally for a single provider.
    pub fn list(conn: &Connection, provider_id: Option<&str>) -> Result<Vec<Account>> {
        let accounts = match provider_id {
            Some(provider) => {
                let sql = format!(
                    "SELECT {} FROM accounts WHERE provider_id = ?1 ORDER BY seq ASC",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([provider.to_lowercase()], from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!("SELECT {} FROM accounts ORDER BY seq ASC", COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(accounts)
    }

    /// Delete an account. Returns false if no row matched.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM accounts WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Number of stored accounts.
    pub fn count(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?)
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let credential_str: String = row.get(3)?;
    let credential: Credential = serde_json::from_str(&credential_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Account {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        email: row.get(2)?,
        credential,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
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

    fn account(provider: &str, email: &str) -> Account {
        Account::new(provider, email, Credential::from_text("session=1"))
    }

    #[test]
    fn upsert_and_get() {
        let conn = setup_db();
        let a = account("kimi", "a@example.com");

        AccountRepo::upsert(&conn, &a).unwrap();
        let loaded = AccountRepo::get_by_id(&conn, &a.id).unwrap().unwrap();

        assert_eq!(loaded.id, a.id);
        assert_eq!(loaded.provider_id, "kimi");
        assert_eq!(loaded.credential.as_str(), Some("session=1"));
        assert_eq!(loaded.created_at.timestamp(), a.created_at.timestamp());
    }

    #[test]
    fn upsert_replaces_credential_and_keeps_order() {
        let conn = setup_db();
        let a = account("kimi", "a@example.com");
        let b = account("kimi", "b@example.com");
        AccountRepo::upsert(&conn, &a).unwrap();
        AccountRepo::upsert(&conn, &b).unwrap();

        let refreshed = a
            .clone()
            .with_credential(Credential::new(json!({"access": "t2", "refresh": "r2"})));
        AccountRepo::upsert(&conn, &refreshed).unwrap();

        let list = AccountRepo::list(&conn, Some("kimi")).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[0].credential.as_value()["refresh"], "r2");
        assert_eq!(list[1].id, b.id);
    }

    #[test]
    fn list_filters_by_provider() {
        let conn = setup_db();
        AccountRepo::upsert(&conn, &account("kimi", "a@example.com")).unwrap();
        AccountRepo::upsert(&conn, &account("qwen", "a@example.com")).unwrap();

        assert_eq!(AccountRepo::list(&conn, Some("KIMI")).unwrap().len(), 1);
        assert_eq!(AccountRepo::list(&conn, None).unwrap().len(), 2);
        assert_eq!(AccountRepo::count(&conn).unwrap(), 2);
    }

    #[test]
    fn identity_lookup_ignores_email_case() {
        let conn = setup_db();
        let a = account("kimi", "Someone@Example.com");
        AccountRepo::upsert(&conn, &a).unwrap();

        let found = AccountRepo::get_by_identity(&conn, "kimi", "someone@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
        assert!(AccountRepo::get_by_identity(&conn, "qwen", "someone@example.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_identity_with_new_id_is_rejected() {
        let conn = setup_db();
        AccountRepo::upsert(&conn, &account("kimi", "a@example.com")).unwrap();
        assert!(AccountRepo::upsert(&conn, &account("kimi", "A@example.com")).is_err());
    }

    #[test]
    fn delete_reports_missing() {
        let conn = setup_db();
        let a = account("kimi", "a@example.com");
        AccountRepo::upsert(&conn, &a).unwrap();

        assert!(AccountRepo::delete(&conn, &a.id).unwrap());
        assert!(!AccountRepo::delete(&conn, &a.id).unwrap());
        assert!(AccountRepo::get_by_id(&conn, &a.id).unwrap().is_none());
    }
}
