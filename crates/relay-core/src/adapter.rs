//! Provider adapter contract and registry.
//!
//! Each upstream integration implements [`ProviderAdapter`] and is registered
//! under a lowercase provider id. Adapters own request shaping, conversation
//! bookkeeping and response parsing; the gateway only sees the callbacks on
//! [`EventSink`] and the final `Result`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::capture::{CredentialValidator, LoginTarget};
use crate::error::AdapterError;
use crate::models::{
    CanonicalStreamEvent, ChatRequest, ConversationDetail, ConversationSummary, Credential,
    ModelInfo, UploadedFile,
};

/// Callback set handed to [`ProviderAdapter::chat_completion_stream`].
///
/// `done` and `error` are expressed by the adapter's return value, so a sink
/// can never emit a terminal event itself.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CanonicalStreamEvent>,
}

impl EventSink {
    /// Creates a sink and the receiver the gateway drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CanonicalStreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits a content fragment. Empty fragments are dropped.
    pub fn content(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            let _ = self.tx.send(CanonicalStreamEvent::Content(text));
        }
    }

    /// Emits a reasoning fragment. Empty fragments are dropped.
    pub fn thinking(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            let _ = self.tx.send(CanonicalStreamEvent::Thinking(text));
        }
    }

    /// Emits provider metadata (conversation ids, message ids, usage).
    pub fn metadata(&self, metadata: Map<String, Value>) {
        let _ = self.tx.send(CanonicalStreamEvent::Metadata(metadata));
    }

    /// Returns true once the gateway has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Contract every upstream integration implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Lowercase provider identifier.
    fn provider_id(&self) -> &str;

    /// Models available to `credential`.
    async fn get_models(&self, credential: &Credential) -> Result<Vec<ModelInfo>, AdapterError>;

    /// Streams a chat completion through `sink`.
    ///
    /// `Ok(())` means the upstream finished; an expired session must surface
    /// as [`AdapterError::AuthExpired`].
    async fn chat_completion_stream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
        sink: EventSink,
    ) -> Result<(), AdapterError>;

    async fn get_conversations(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<ConversationSummary>, AdapterError> {
        Err(AdapterError::Unsupported("get_conversations"))
    }

    async fn get_conversation_detail(
        &self,
        _credential: &Credential,
        _conversation_id: &str,
    ) -> Result<ConversationDetail, AdapterError> {
        Err(AdapterError::Unsupported("get_conversation_detail"))
    }

    async fn stop_stream(
        &self,
        _credential: &Credential,
        _conversation_id: &str,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("stop_stream"))
    }

    async fn upload_file(
        &self,
        _credential: &Credential,
        _name: &str,
        _bytes: Vec<u8>,
    ) -> Result<UploadedFile, AdapterError> {
        Err(AdapterError::Unsupported("upload_file"))
    }

    /// Exchanges an expired credential for a fresh one.
    async fn refresh_credential(
        &self,
        _credential: &Credential,
    ) -> Result<Credential, AdapterError> {
        Err(AdapterError::Unsupported("refresh_credential"))
    }

    /// How to capture a session for this provider, if it supports capture.
    fn login_target(&self) -> Option<LoginTarget> {
        None
    }

    /// Validator for artifacts captured with [`Self::login_target`].
    fn validator(&self) -> Option<Arc<dyn CredentialValidator>> {
        None
    }
}

/// Statically populated lookup of adapters by provider id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<String, Arc<dyn ProviderAdapter>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.provider_ids())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its lowercased provider id, replacing any
    /// previous registration.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let id = adapter.provider_id().to_lowercase();
        tracing::info!(provider = %id, "Registered provider adapter");
        self.adapters.write().insert(id, adapter);
    }

    /// Looks up the adapter for `provider_id` (case-insensitive).
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .get(&provider_id.to_lowercase())
            .cloned()
    }

    /// Registered provider ids, sorted.
    pub fn provider_ids(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        fn provider_id(&self) -> &str {
            "Echo"
        }

        async fn get_models(&self, _: &Credential) -> Result<Vec<ModelInfo>, AdapterError> {
            Ok(vec![ModelInfo::new("echo", "echo-1")])
        }

        async fn chat_completion_stream(
            &self,
            _: &Credential,
            request: &ChatRequest,
            sink: EventSink,
        ) -> Result<(), AdapterError> {
            for message in &request.messages {
                sink.content(message.content.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("ECHO").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.provider_ids(), vec!["echo"]);
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_unsupported() {
        let credential = Credential::from_text("x");
        let echo = Echo;

        assert!(matches!(
            echo.get_conversations(&credential).await,
            Err(AdapterError::Unsupported(_))
        ));
        assert!(matches!(
            echo.refresh_credential(&credential).await,
            Err(AdapterError::Unsupported(_))
        ));
        assert!(echo.login_target().is_none());
        assert!(echo.validator().is_none());
    }

    #[tokio::test]
    async fn sink_drops_empty_fragments() {
        let (sink, mut rx) = EventSink::channel();
        sink.content("");
        sink.thinking("");
        sink.content("hi");
        drop(sink);

        assert_eq!(rx.recv().await, Some(CanonicalStreamEvent::Content("hi".into())));
        assert_eq!(rx.recv().await, None);
    }
}
