//! Account selection strategies and usage counters.
//!
//! Round-robin cursors and usage counters live for the process lifetime and
//! are only reset by explicit operator action.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::models::Account;
use crate::store::AccountStore;

/// Cursor key used when no provider filter is given.
const ALL_PROVIDERS: &str = "*";

/// How to pick among the accounts of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Rotate through the pool, one cursor per provider.
    RoundRobin,
    /// Store order is priority order: always the first account.
    Priority,
    /// First account of the filtered set.
    #[default]
    First,
}

#[derive(Debug, Default)]
struct SelectionState {
    cursors: HashMap<String, usize>,
    usage: HashMap<String, u64>,
}

/// Picks accounts out of an [`AccountStore`].
pub struct AccountSelector {
    store: Arc<dyn AccountStore>,
    state: Mutex<SelectionState>,
}

impl std::fmt::Debug for AccountSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSelector")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl AccountSelector {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            state: Mutex::new(SelectionState::default()),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Selects an account.
    ///
    /// A matching `email` wins outright. Otherwise `strategy` is applied to
    /// the accounts of `provider_id` (or all accounts). Every successful
    /// selection bumps that account's usage counter.
    pub fn select_account(
        &self,
        provider_id: Option<&str>,
        strategy: SelectionStrategy,
        email: Option<&str>,
    ) -> Result<Option<Account>, StoreError> {
        let pool = self.store.list(provider_id)?;
        if pool.is_empty() {
            return Ok(None);
        }

        let mut state = self.state.lock();

        if let Some(email) = email {
            if let Some(account) = pool.iter().find(|a| a.email.eq_ignore_ascii_case(email)) {
                *state.usage.entry(account.id.clone()).or_default() += 1;
                return Ok(Some(account.clone()));
            }
        }

        let index = match strategy {
            SelectionStrategy::RoundRobin => {
                let key = provider_id
                    .map(str::to_lowercase)
                    .unwrap_or_else(|| ALL_PROVIDERS.to_string());
                let cursor = state.cursors.entry(key).or_default();
                let index = *cursor % pool.len();
                *cursor = (index + 1) % pool.len();
                index
            }
            SelectionStrategy::Priority | SelectionStrategy::First => 0,
        };

        let account = pool[index].clone();
        *state.usage.entry(account.id.clone()).or_default() += 1;

        debug!(
            account = %account.id,
            provider = %account.provider_id,
            ?strategy,
            "Selected account"
        );
        Ok(Some(account))
    }

    /// Records a use of `account_id` made without going through selection.
    pub fn record_use(&self, account_id: &str) {
        *self
            .state
            .lock()
            .usage
            .entry(account_id.to_string())
            .or_default() += 1;
    }

    /// Usage count for one account.
    pub fn usage_count(&self, account_id: &str) -> u64 {
        self.state
            .lock()
            .usage
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of every usage counter.
    pub fn usage_counts(&self) -> HashMap<String, u64> {
        self.state.lock().usage.clone()
    }

    /// Clears usage counters without touching stored accounts.
    pub fn reset_counts(&self) {
        self.state.lock().usage.clear();
    }

    /// Rewinds every round-robin cursor.
    pub fn reset_cursors(&self) {
        self.state.lock().cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credential;
    use crate::store::MemoryAccountStore;

    fn account(provider: &str, email: &str) -> Account {
        Account::new(provider, email, Credential::from_text("c"))
    }

    fn selector(accounts: Vec<Account>) -> AccountSelector {
        AccountSelector::new(Arc::new(MemoryAccountStore::with_accounts(accounts)))
    }

    fn pick(selector: &AccountSelector, provider: &str) -> String {
        selector
            .select_account(Some(provider), SelectionStrategy::RoundRobin, None)
            .unwrap()
            .unwrap()
            .email
    }

    #[test]
    fn round_robin_two_accounts_alternates() {
        let selector = selector(vec![account("p", "a"), account("p", "b")]);
        let picks: Vec<String> = (0..3).map(|_| pick(&selector, "p")).collect();
        assert_eq!(picks, vec!["a", "b", "a"]);
    }

    #[test]
    fn round_robin_is_balanced() {
        let accounts: Vec<Account> = ["a", "b", "c"].iter().map(|e| account("p", e)).collect();
        let ids: Vec<String> = accounts.iter().map(|a| a.id.clone()).collect();
        let selector = selector(accounts);

        let n = 10;
        let picks: Vec<String> = (0..n).map(|_| pick(&selector, "p")).collect();

        // The sequence is the account list rotated and repeated.
        for (i, email) in picks.iter().enumerate() {
            assert_eq!(email, ["a", "b", "c"][i % 3]);
        }

        let k = ids.len() as u64;
        for id in &ids {
            let count = selector.usage_count(id);
            assert!(count == n / k || count == n / k + 1, "count {}", count);
        }
    }

    #[test]
    fn round_robin_cursors_are_per_provider() {
        let selector = selector(vec![
            account("p", "p1"),
            account("p", "p2"),
            account("q", "q1"),
            account("q", "q2"),
        ]);

        assert_eq!(pick(&selector, "p"), "p1");
        assert_eq!(pick(&selector, "q"), "q1");
        assert_eq!(pick(&selector, "p"), "p2");
        assert_eq!(pick(&selector, "q"), "q2");
    }

    #[test]
    fn email_bypasses_strategy() {
        let selector = selector(vec![account("p", "a@x"), account("p", "b@x")]);

        let chosen = selector
            .select_account(Some("p"), SelectionStrategy::RoundRobin, Some("b@x"))
            .unwrap()
            .unwrap();
        assert_eq!(chosen.email, "b@x");

        // Cursor untouched by the explicit pick.
        assert_eq!(pick(&selector, "p"), "a@x");
    }

    #[test]
    fn unknown_email_falls_back_to_strategy() {
        let selector = selector(vec![account("p", "a@x"), account("p", "b@x")]);
        let chosen = selector
            .select_account(Some("p"), SelectionStrategy::Priority, Some("nobody@x"))
            .unwrap()
            .unwrap();
        assert_eq!(chosen.email, "a@x");
    }

    #[test]
    fn priority_and_first_pick_first_account() {
        let selector = selector(vec![account("p", "a"), account("p", "b")]);
        for strategy in [SelectionStrategy::Priority, SelectionStrategy::First] {
            let chosen = selector
                .select_account(Some("p"), strategy, None)
                .unwrap()
                .unwrap();
            assert_eq!(chosen.email, "a");
        }
    }

    #[test]
    fn empty_pool_returns_none() {
        let selector = selector(vec![account("p", "a")]);
        let chosen = selector
            .select_account(Some("other"), SelectionStrategy::RoundRobin, None)
            .unwrap();
        assert!(chosen.is_none());
    }

    #[test]
    fn reset_counts_keeps_accounts() {
        let a = account("p", "a");
        let id = a.id.clone();
        let selector = selector(vec![a]);

        pick(&selector, "p");
        pick(&selector, "p");
        assert_eq!(selector.usage_count(&id), 2);

        selector.reset_counts();
        assert_eq!(selector.usage_count(&id), 0);
        assert!(selector.usage_counts().is_empty());
        assert_eq!(selector.store().list(None).unwrap().len(), 1);
    }
}
