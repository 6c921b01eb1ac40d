//! Hook pipeline run by the proxy for every intercepted exchange.
//!
//! Four extension points, each run for every registered hook in
//! registration order:
//!
//! ```text
//! request headers ─► on_request ─► on_request_data ─► upstream
//!                                                        │
//! client ◄─ on_response_body ◄─ on_response ◄────────────┘
//! ```
//!
//! Returning from a hook method advances the pipeline. A hook that never
//! returns stalls that exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::RwLock;

/// Request seen by hooks. Header edits are applied to the forwarded request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    /// Lowercase host without port.
    pub host: String,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Value of a header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Response seen by hooks. Header edits are applied to the forwarded response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub request: RequestContext,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Extension points of the proxy pipeline. Every method defaults to a no-op.
#[async_trait]
pub trait ProxyHook: Send + Sync {
    /// Called with the request headers before anything is forwarded.
    async fn on_request(&self, _ctx: &mut RequestContext) {}

    /// Called with the request body of non-multipart requests on tracked hosts.
    async fn on_request_data(&self, _ctx: &RequestContext, _data: &[u8]) {}

    /// Called with the response headers.
    async fn on_response(&self, _ctx: &mut ResponseContext) {}

    /// Called with the decompressed body of textual responses on tracked hosts.
    async fn on_response_body(&self, _ctx: &ResponseContext, _body: &[u8]) {}
}

/// Identifies an installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Inner {
    hooks: RwLock<Vec<(HookId, Arc<dyn ProxyHook>)>>,
    next_id: AtomicU64,
}

/// Ordered, shared list of hooks. Clones share the same list.
#[derive(Clone, Default)]
pub struct HookPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("hooks", &self.len())
            .finish()
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook; it runs after every hook added before it.
    pub fn add(&self, hook: Arc<dyn ProxyHook>) -> HookId {
        let id = HookId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.hooks.write().push((id, hook));
        id
    }

    /// Removes a hook. Returns false if it was not installed.
    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.inner.hooks.write();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current hooks, so no lock is held while they run.
    fn snapshot(&self) -> Vec<Arc<dyn ProxyHook>> {
        self.inner
            .hooks
            .read()
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect()
    }

    pub async fn run_request(&self, ctx: &mut RequestContext) {
        for hook in self.snapshot() {
            hook.on_request(ctx).await;
        }
    }

    pub async fn run_request_data(&self, ctx: &RequestContext, data: &[u8]) {
        for hook in self.snapshot() {
            hook.on_request_data(ctx, data).await;
        }
    }

    pub async fn run_response(&self, ctx: &mut ResponseContext) {
        for hook in self.snapshot() {
            hook.on_response(ctx).await;
        }
    }

    pub async fn run_response_body(&self, ctx: &ResponseContext, body: &[u8]) {
        for hook in self.snapshot() {
            hook.on_response_body(ctx, body).await;
        }
    }
}
