//! Chat gateway.
//!
//! Resolves an account and model for each request, dispatches to the
//! provider adapter and normalizes the adapter's callbacks into one
//! [`CanonicalStreamEvent`] stream.
//!
//! ## Resolution order
//!
//! ```text
//! account_id ──► provider_id ──► model "auto" ──► model → provider index
//!   (explicit)    (selector)     (top provider     (static + learned)
//!                                 only, no fallback)
//! ```
//!
//! Authentication expiry gets exactly one refresh followed by exactly one
//! retry. Cancellation drops the in-flight upstream call and ends the stream
//! without a terminal event.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, EventSink, ProviderAdapter};
use crate::error::{AdapterError, GatewayError, Result};
use crate::models::{Account, CanonicalStreamEvent, ChatCompletion, ChatRequest, ModelInfo};
use crate::routing::RoutingConfig;
use crate::selector::AccountSelector;
use crate::store::AccountStore;

/// Capacity of the per-request output channel.
const STREAM_BUFFER: usize = 64;

/// Normalized event stream for one request.
///
/// Dropping the stream cancels the upstream call.
pub struct ChatStream {
    rx: mpsc::Receiver<CanonicalStreamEvent>,
    account_id: String,
    provider_id: String,
    model_id: String,
    _cancel: DropGuard,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("account_id", &self.account_id)
            .field("provider_id", &self.provider_id)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl ChatStream {
    /// Receives the next event, or `None` once the stream is over.
    pub async fn next_event(&mut self) -> Option<CanonicalStreamEvent> {
        self.rx.recv().await
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Concrete model the request was dispatched with.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Stream for ChatStream {
    type Item = CanonicalStreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Writes canonical events for one request and enforces the terminal rule.
struct Output {
    tx: mpsc::Sender<CanonicalStreamEvent>,
    buffered: bool,
    terminated: bool,
    forwarded: bool,
    content: String,
    thinking: String,
    metadata: Map<String, Value>,
}

impl Output {
    fn new(tx: mpsc::Sender<CanonicalStreamEvent>, buffered: bool) -> Self {
        Self {
            tx,
            buffered,
            terminated: false,
            forwarded: false,
            content: String::new(),
            thinking: String::new(),
            metadata: Map::new(),
        }
    }

    /// True once an event has reached the caller. A retry after that point
    /// would duplicate output.
    fn has_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Drops whatever a failed attempt left in the buffers.
    fn discard(&mut self) {
        self.content.clear();
        self.thinking.clear();
        self.metadata.clear();
    }

    /// Forwards or buffers an adapter event. Returns false if the caller is gone.
    async fn push(&mut self, event: CanonicalStreamEvent) -> bool {
        if self.terminated || event.is_terminal() {
            return true;
        }

        if !self.buffered {
            self.forwarded = true;
            return self.tx.send(event).await.is_ok();
        }

        match event {
            CanonicalStreamEvent::Content(text) => self.content.push_str(&text),
            CanonicalStreamEvent::Thinking(text) => self.thinking.push_str(&text),
            CanonicalStreamEvent::Metadata(map) => self.metadata.extend(map),
            CanonicalStreamEvent::Error(_) | CanonicalStreamEvent::Done => {}
        }
        true
    }

    async fn done(&mut self) {
        if self.terminated {
            return;
        }
        if self.buffered {
            let thinking = std::mem::take(&mut self.thinking);
            let content = std::mem::take(&mut self.content);
            let metadata = std::mem::take(&mut self.metadata);
            if !thinking.is_empty() {
                let _ = self.tx.send(CanonicalStreamEvent::Thinking(thinking)).await;
            }
            if !content.is_empty() {
                let _ = self.tx.send(CanonicalStreamEvent::Content(content)).await;
            }
            if !metadata.is_empty() {
                let _ = self.tx.send(CanonicalStreamEvent::Metadata(metadata)).await;
            }
        }
        self.terminated = true;
        let _ = self.tx.send(CanonicalStreamEvent::Done).await;
    }

    async fn error(&mut self, message: String) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let _ = self.tx.send(CanonicalStreamEvent::Error(message)).await;
    }
}

/// Everything a dispatch task needs, detached from the gateway.
struct Dispatch {
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<dyn AccountStore>,
    account: Account,
    request: ChatRequest,
}

/// Runs one adapter call, forwarding its events.
///
/// Returns `None` if the request was cancelled or the caller went away.
async fn attempt(
    dispatch: &Dispatch,
    out: &mut Output,
    token: &CancellationToken,
) -> Option<std::result::Result<(), AdapterError>> {
    let (sink, mut rx) = EventSink::channel();
    let call = dispatch.adapter.chat_completion_stream(
        &dispatch.account.credential,
        &dispatch.request,
        sink,
    );
    tokio::pin!(call);

    let result = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            Some(event) = rx.recv() => {
                if !out.push(event).await {
                    token.cancel();
                    return None;
                }
            }
            result = &mut call => break result,
        }
    };

    // The sink is dropped with the finished call; flush what it left behind.
    while let Ok(event) = rx.try_recv() {
        if token.is_cancelled() || !out.push(event).await {
            return None;
        }
    }
    Some(result)
}

async fn run(mut dispatch: Dispatch, mut out: Output, token: CancellationToken) {
    let provider = dispatch.account.provider_id.clone();
    let mut refreshed = false;

    loop {
        let Some(result) = attempt(&dispatch, &mut out, &token).await else {
            debug!(provider = %provider, "Chat request cancelled");
            return;
        };

        // The adapter may have returned in the same poll that observed cancellation.
        if token.is_cancelled() {
            debug!(provider = %provider, "Chat request cancelled");
            return;
        }

        match result {
            Ok(()) => {
                out.done().await;
                return;
            }
            Err(err) if err.is_auth_expired() && !refreshed && !out.has_forwarded() => {
                refreshed = true;
                out.discard();
                warn!(
                    provider = %provider,
                    account = %dispatch.account.id,
                    "Upstream session expired, refreshing credential"
                );

                let refresh = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    refresh = dispatch.adapter.refresh_credential(&dispatch.account.credential) => refresh,
                };

                match refresh {
                    Ok(credential) => {
                        dispatch.account = dispatch.account.clone().with_credential(credential);
                        if let Err(e) = dispatch.store.upsert(&dispatch.account) {
                            warn!("Failed to persist refreshed credential: {}", e);
                        }
                        info!(account = %dispatch.account.id, "Credential refreshed, retrying once");
                    }
                    Err(refresh_err) => {
                        out.error(format!(
                            "{}; credential refresh failed: {}",
                            err, refresh_err
                        ))
                        .await;
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(provider = %provider, "Chat request failed: {}", err);
                out.error(err.to_string()).await;
                return;
            }
        }
    }
}

/// Provider-agnostic chat entry point.
pub struct ChatGateway {
    selector: Arc<AccountSelector>,
    registry: Arc<AdapterRegistry>,
    routing: RoutingConfig,
    learned_models: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for ChatGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGateway")
            .field("registry", &self.registry)
            .field("routing", &self.routing)
            .finish()
    }
}

impl ChatGateway {
    pub fn new(
        selector: Arc<AccountSelector>,
        registry: Arc<AdapterRegistry>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            selector,
            registry,
            routing,
            learned_models: RwLock::new(HashMap::new()),
        }
    }

    pub fn selector(&self) -> &Arc<AccountSelector> {
        &self.selector
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    fn provider_for_model(&self, model_id: &str) -> Option<String> {
        if let Some(provider) = self.routing.provider_for_model(model_id) {
            return Some(provider.to_string());
        }
        self.learned_models.read().get(model_id).cloned()
    }

    /// Resolves the account and concrete request for `request`.
    ///
    /// Fails before any upstream traffic when no account can be found.
    pub fn resolve(&self, request: &ChatRequest) -> Result<(Account, ChatRequest)> {
        let routing = &self.routing;
        let store = self.selector.store();

        let account = if let Some(account_id) = &request.account_id {
            let account = store
                .get(account_id)?
                .ok_or_else(|| GatewayError::AccountNotFound(account_id.clone()))?;
            if let Some(requested) = &request.provider_id {
                if !account.provider_id.eq_ignore_ascii_case(requested) {
                    return Err(GatewayError::AccountProviderMismatch {
                        account: account.id,
                        actual: account.provider_id,
                        requested: requested.clone(),
                    });
                }
            }
            self.selector.record_use(&account.id);
            account
        } else {
            let provider = if let Some(provider) = &request.provider_id {
                provider.to_lowercase()
            } else if request.is_auto() {
                routing
                    .auto_provider()
                    .map(str::to_lowercase)
                    .ok_or_else(|| GatewayError::NoAccountAvailable("auto".into()))?
            } else {
                self.provider_for_model(&request.model_id)
                    .ok_or_else(|| GatewayError::UnknownModel(request.model_id.clone()))?
            };

            self.selector
                .select_account(Some(&provider), routing.strategy, None)?
                .ok_or(GatewayError::NoAccountAvailable(provider))?
        };

        let mut resolved = request.clone();
        resolved.provider_id = Some(account.provider_id.clone());
        resolved.account_id = Some(account.id.clone());
        if request.is_auto() {
            if let Some(model) = routing.auto_model(&account.provider_id) {
                resolved.model_id = model.to_string();
            }
        }

        Ok((account, resolved))
    }

    /// Sends a chat request and returns its canonical event stream.
    ///
    /// When `request.stream` is false, content and thinking are buffered and
    /// delivered as single events right before `Done`.
    pub fn send(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatStream> {
        let (account, request) = self.resolve(&request)?;
        let adapter = self
            .registry
            .get(&account.provider_id)
            .ok_or_else(|| GatewayError::AdapterNotFound(account.provider_id.clone()))?;

        info!(
            provider = %account.provider_id,
            account = %account.id,
            model = %request.model_id,
            stream = request.stream,
            "Dispatching chat request"
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let token = cancel.child_token();
        let stream = ChatStream {
            rx,
            account_id: account.id.clone(),
            provider_id: account.provider_id.clone(),
            model_id: request.model_id.clone(),
            _cancel: token.clone().drop_guard(),
        };

        let out = Output::new(tx, !request.stream);
        let dispatch = Dispatch {
            adapter,
            store: self.selector.store().clone(),
            account,
            request,
        };
        tokio::spawn(run(dispatch, out, token));

        Ok(stream)
    }

    /// Runs a request to completion and returns the buffered result.
    pub async fn complete(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatCompletion> {
        let mut stream = self.send(request.with_stream(false), cancel)?;
        let mut completion = ChatCompletion {
            account_id: stream.account_id().to_string(),
            provider_id: stream.provider_id().to_string(),
            model_id: stream.model_id().to_string(),
            ..ChatCompletion::default()
        };

        while let Some(event) = stream.next_event().await {
            match event {
                CanonicalStreamEvent::Content(text) => completion.content.push_str(&text),
                CanonicalStreamEvent::Thinking(text) => completion.thinking.push_str(&text),
                CanonicalStreamEvent::Metadata(map) => completion.metadata.extend(map),
                CanonicalStreamEvent::Error(message) => return Err(GatewayError::Upstream(message)),
                CanonicalStreamEvent::Done => return Ok(completion),
            }
        }
        Err(GatewayError::Cancelled)
    }

    /// Lists models for one provider, or for every registered provider.
    ///
    /// Listing uses the first stored account and does not count as usage.
    /// Returned models feed the model → provider index.
    pub async fn list_models(&self, provider_id: Option<&str>) -> Result<Vec<ModelInfo>> {
        let providers = match provider_id {
            Some(p) => vec![p.to_lowercase()],
            None => self.registry.provider_ids(),
        };

        let mut models = Vec::new();
        for provider in providers {
            let adapter = self
                .registry
                .get(&provider)
                .ok_or_else(|| GatewayError::AdapterNotFound(provider.clone()))?;
            let Some(account) = self.selector.store().list(Some(&provider))?.into_iter().next()
            else {
                if provider_id.is_some() {
                    return Err(GatewayError::NoAccountAvailable(provider));
                }
                continue;
            };

            match adapter.get_models(&account.credential).await {
                Ok(found) => {
                    let mut learned = self.learned_models.write();
                    for model in &found {
                        learned.insert(model.id.clone(), provider.clone());
                    }
                    models.extend(found);
                }
                Err(e) if provider_id.is_some() => return Err(e.into()),
                Err(e) => warn!(provider = %provider, "Failed to list models: {}", e),
            }
        }
        Ok(models)
    }
}
