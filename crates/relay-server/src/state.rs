//! Application state for the API server.

use std::sync::Arc;

use relay_core::{AccountSelector, AdapterRegistry, ChatGateway, MemoryAccountStore, RoutingConfig};
use relay_storage::{Database, SqliteAccountStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Chat gateway (owns the selector and adapter registry).
    pub gateway: Arc<ChatGateway>,
}

impl AppState {
    /// Creates state around an existing gateway.
    pub fn new(gateway: Arc<ChatGateway>) -> Self {
        Self { gateway }
    }

    /// Creates state backed by `db`, using the routing stored in it.
    pub fn with_database(
        db: Database,
        registry: Arc<AdapterRegistry>,
    ) -> relay_storage::Result<Self> {
        let routing = db.routing_config()?;
        let store = Arc::new(SqliteAccountStore::new(db));
        let selector = Arc::new(AccountSelector::new(store));
        Ok(Self::new(Arc::new(ChatGateway::new(selector, registry, routing))))
    }

    /// Creates state with an in-memory account store and no adapters.
    pub fn in_memory() -> Self {
        let selector = Arc::new(AccountSelector::new(Arc::new(MemoryAccountStore::new())));
        Self::new(Arc::new(ChatGateway::new(
            selector,
            Arc::new(AdapterRegistry::new()),
            RoutingConfig::default(),
        )))
    }

    pub fn selector(&self) -> &Arc<AccountSelector> {
        self.gateway.selector()
    }
}
