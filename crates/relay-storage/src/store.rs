//! SQLite-backed [`AccountStore`].

use relay_core::{Account, AccountStore, StoreError};

use crate::database::Database;

/// Account store persisting to the Relay database.
#[derive(Clone)]
pub struct SqliteAccountStore {
    db: Database,
}

impl SqliteAccountStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl AccountStore for SqliteAccountStore {
    fn get(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.db.get_account(id)?)
    }

    fn list(&self, provider_id: Option<&str>) -> Result<Vec<Account>, StoreError> {
        Ok(self.db.list_accounts(provider_id)?)
    }

    fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        Ok(self.db.upsert_account(account)?)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.db.delete_account(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{AccountSelector, Credential, SelectionStrategy};
    use std::sync::Arc;

    #[test]
    fn selector_rotates_over_sqlite_accounts() {
        let db = Database::in_memory().unwrap();
        for email in ["a@x", "b@x"] {
            db.save_captured_account("kimi", email, Credential::from_text("c"))
                .unwrap();
        }
        let selector = AccountSelector::new(Arc::new(SqliteAccountStore::new(db)));

        let picks: Vec<String> = (0..3)
            .map(|_| {
                selector
                    .select_account(Some("kimi"), SelectionStrategy::RoundRobin, None)
                    .unwrap()
                    .unwrap()
                    .email
            })
            .collect();
        assert_eq!(picks, vec!["a@x", "b@x", "a@x"]);
    }

    #[test]
    fn store_crud_through_trait() {
        let store: Arc<dyn AccountStore> =
            Arc::new(SqliteAccountStore::new(Database::in_memory().unwrap()));
        let account = Account::new("qwen", "q@x", Credential::from_text("t"));

        store.upsert(&account).unwrap();
        assert_eq!(store.get(&account.id).unwrap().unwrap().email, "q@x");
        assert!(store.delete(&account.id).unwrap());
        assert!(store.list(None).unwrap().is_empty());
    }
}
