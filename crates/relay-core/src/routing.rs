//! Routing configuration for provider and model resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::selector::SelectionStrategy;

/// One entry of a priority sequence. Lower `priority` wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub id: String,
    pub priority: u32,
}

impl PriorityEntry {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

/// Resolution rules used by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Provider preference for `model = "auto"`.
    #[serde(default)]
    pub auto_providers: Vec<PriorityEntry>,
    /// Per-provider model preference for `model = "auto"`.
    #[serde(default)]
    pub auto_models: HashMap<String, Vec<PriorityEntry>>,
    /// Static model id to provider id index.
    #[serde(default)]
    pub model_providers: HashMap<String, String>,
    /// Strategy used when a request names only a provider.
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

fn highest(entries: &[PriorityEntry]) -> Option<&str> {
    entries
        .iter()
        .min_by_key(|e| e.priority)
        .map(|e| e.id.as_str())
}

impl RoutingConfig {
    /// The single highest-priority provider for automatic routing.
    ///
    /// Lower entries are never consulted, even if the winner has no account.
    pub fn auto_provider(&self) -> Option<&str> {
        highest(&self.auto_providers)
    }

    /// The highest-priority model within `provider_id`'s own sequence.
    pub fn auto_model(&self, provider_id: &str) -> Option<&str> {
        self.auto_models
            .iter()
            .find(|(p, _)| p.eq_ignore_ascii_case(provider_id))
            .and_then(|(_, seq)| highest(seq))
    }

    /// Provider serving `model_id` according to the static index.
    pub fn provider_for_model(&self, model_id: &str) -> Option<&str> {
        self.model_providers
            .get(model_id)
            .or_else(|| {
                self.model_providers
                    .iter()
                    .find(|(m, _)| m.eq_ignore_ascii_case(model_id))
                    .map(|(_, p)| p)
            })
            .map(String::as_str)
    }

    pub fn with_auto_provider(mut self, provider_id: impl Into<String>, priority: u32) -> Self {
        self.auto_providers
            .push(PriorityEntry::new(provider_id, priority));
        self
    }

    pub fn with_auto_model(
        mut self,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        priority: u32,
    ) -> Self {
        self.auto_models
            .entry(provider_id.into())
            .or_default()
            .push(PriorityEntry::new(model_id, priority));
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        self.model_providers
            .insert(model_id.into(), provider_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_provider_uses_lowest_priority_value() {
        let config = RoutingConfig::default()
            .with_auto_provider("y", 2)
            .with_auto_provider("x", 1);
        assert_eq!(config.auto_provider(), Some("x"));
    }

    #[test]
    fn auto_model_is_scoped_to_provider() {
        let config = RoutingConfig::default()
            .with_auto_model("x", "x-large", 2)
            .with_auto_model("x", "x-fast", 1)
            .with_auto_model("y", "y-1", 1);
        assert_eq!(config.auto_model("x"), Some("x-fast"));
        assert_eq!(config.auto_model("Y"), Some("y-1"));
        assert_eq!(config.auto_model("z"), None);
    }

    #[test]
    fn model_index_lookup() {
        let config = RoutingConfig::default().with_model("kimi-k2", "kimi");
        assert_eq!(config.provider_for_model("kimi-k2"), Some("kimi"));
        assert_eq!(config.provider_for_model("KIMI-K2"), Some("kimi"));
        assert_eq!(config.provider_for_model("other"), None);
    }

    #[test]
    fn empty_config_deserializes() {
        let config: RoutingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RoutingConfig::default());
        assert_eq!(config.strategy, SelectionStrategy::First);
    }
}
