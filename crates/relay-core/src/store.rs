//! Account persistence seam.
//!
//! The gateway only needs CRUD over accounts; the SQLite backend lives in
//! `relay-storage`. [`MemoryAccountStore`] serves tests and ephemeral runs.

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::models::Account;

/// CRUD operations the core depends on.
pub trait AccountStore: Send + Sync {
    /// Fetches an account by id.
    fn get(&self, id: &str) -> Result<Option<Account>, StoreError>;

    /// Lists accounts in creation order, optionally filtered by provider.
    fn list(&self, provider_id: Option<&str>) -> Result<Vec<Account>, StoreError>;

    /// Inserts or replaces an account.
    fn upsert(&self, account: &Account) -> Result<(), StoreError>;

    /// Deletes an account. Returns false if it did not exist.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// In-memory account store preserving insertion order.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<Vec<Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `accounts`.
    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: RwLock::new(accounts.into_iter().collect()),
        }
    }
}

impl AccountStore for MemoryAccountStore {
    fn get(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().iter().find(|a| a.id == id).cloned())
    }

    fn list(&self, provider_id: Option<&str>) -> Result<Vec<Account>, StoreError> {
        let accounts = self.accounts.read();
        Ok(accounts
            .iter()
            .filter(|a| provider_id.is_none_or(|p| a.provider_id.eq_ignore_ascii_case(p)))
            .cloned()
            .collect())
    }

    fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        match accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account.clone(),
            None => accounts.push(account.clone()),
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut accounts = self.accounts.write();
        let before = accounts.len();
        accounts.retain(|a| a.id != id);
        Ok(accounts.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credential;

    fn account(provider: &str, email: &str) -> Account {
        Account::new(provider, email, Credential::from_text("token"))
    }

    #[test]
    fn memory_store_crud() {
        let store = MemoryAccountStore::new();
        let a = account("kimi", "a@example.com");

        store.upsert(&a).unwrap();
        assert_eq!(store.get(&a.id).unwrap(), Some(a.clone()));

        let updated = a.clone().with_credential(Credential::from_text("fresh"));
        store.upsert(&updated).unwrap();
        assert_eq!(store.list(None).unwrap().len(), 1);
        assert_eq!(
            store.get(&a.id).unwrap().unwrap().credential.as_str(),
            Some("fresh")
        );

        assert!(store.delete(&a.id).unwrap());
        assert!(!store.delete(&a.id).unwrap());
        assert!(store.get(&a.id).unwrap().is_none());
    }

    #[test]
    fn memory_store_filters_by_provider() {
        let store = MemoryAccountStore::with_accounts([
            account("kimi", "a@example.com"),
            account("qwen", "b@example.com"),
            account("kimi", "c@example.com"),
        ]);

        let kimi = store.list(Some("KIMI")).unwrap();
        assert_eq!(kimi.len(), 2);
        assert_eq!(kimi[0].email, "a@example.com");
        assert_eq!(kimi[1].email, "c@example.com");
        assert_eq!(store.list(None).unwrap().len(), 3);
    }
}
