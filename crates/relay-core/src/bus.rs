//! Credential event bus.
//!
//! A transport-independent publish/subscribe multiplexer keyed by event name.
//! Proxy hooks publish captured artifacts; capture sessions subscribe for
//! the lifetime of one login.
//!
//! Handlers registered for the same name fire in subscription order. There is
//! no ordering guarantee across distinct names.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Artifact captured by a proxy hook. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedArtifact {
    pub event_name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl CapturedArtifact {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Event handler callback.
pub type Handler = Arc<dyn Fn(&CapturedArtifact) + Send + Sync>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Inner {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

/// In-process pub/sub channel for captured credentials.
#[derive(Clone, Default)]
pub struct CredentialBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CredentialBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.inner.handlers.read();
        f.debug_struct("CredentialBus")
            .field("events", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an artifact to every handler of `event_name`.
    ///
    /// Handlers run synchronously on the caller's task, outside the lock.
    pub fn emit(&self, event_name: &str, payload: Value) {
        let handlers: Vec<Handler> = {
            let map = self.inner.handlers.read();
            match map.get(event_name) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        let artifact = CapturedArtifact::new(event_name, payload);
        tracing::trace!(
            event = event_name,
            handlers = handlers.len(),
            "Dispatching captured artifact"
        );
        for handler in handlers {
            handler(&artifact);
        }
    }

    /// Registers a handler for `event_name`.
    pub fn on<F>(&self, event_name: &str, handler: F) -> HandlerId
    where
        F: Fn(&CapturedArtifact) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn off(&self, event_name: &str, id: HandlerId) -> bool {
        let mut map = self.inner.handlers.write();
        let Some(list) = map.get_mut(event_name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(event_name);
        }
        removed
    }

    /// Number of handlers registered for `event_name`.
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Subscribes to several events at once, forwarding artifacts to a channel.
    ///
    /// Every handler is removed when the returned [`Subscription`] is dropped.
    pub fn subscribe(
        &self,
        event_names: &[String],
    ) -> (Subscription, mpsc::UnboundedReceiver<CapturedArtifact>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registrations = Vec::with_capacity(event_names.len());

        for name in event_names {
            let tx = tx.clone();
            let id = self.on(name, move |artifact| {
                let _ = tx.send(artifact.clone());
            });
            registrations.push((name.clone(), id));
        }

        (
            Subscription {
                bus: self.clone(),
                registrations,
            },
            rx,
        )
    }
}

/// Scoped set of bus handlers, unsubscribed on drop.
pub struct Subscription {
    bus: CredentialBus,
    registrations: Vec<(String, HandlerId)>,
}

impl Subscription {
    /// Event names covered by this subscription.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|(name, _)| name.as_str())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for (name, id) in self.registrations.drain(..) {
            self.bus.off(&name, id);
        }
    }
}
