//! MITM proxy engine.
//!
//! One engine owns one listening socket. `start` and `stop` may be called
//! any number of times; the hook pipeline survives restarts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::ca::{CaManager, LeafAuthority};
use crate::error::{ProxyError, Result};
use crate::handler::{PipelineHandler, DEFAULT_MAX_BODY_BYTES};
use crate::hooks::{HookId, HookPipeline, ProxyHook};
use crate::DEFAULT_PROXY_PORT;

/// How long `stop` waits for open connections before aborting the server.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Proxy engine configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Host suffixes whose bodies are buffered for hooks. Empty tracks all.
    pub tracked_hosts: Vec<String>,
    /// Largest body handed to body hooks.
    pub max_body_bytes: usize,
}

impl ProxyConfig {
    /// Creates a configuration on the default port using `ca_manager`.
    pub fn new(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            tracked_hosts: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Creates a configuration with the CA in the default data directory.
    pub fn with_default_dir() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir().map_err(ProxyError::Ca)?;
        Ok(Self::new(ca_manager))
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Sets the tracked host suffixes.
    pub fn with_tracked_hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tracked_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the body size cap for body hooks.
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Intercepting proxy with a shared hook pipeline.
pub struct ProxyEngine {
    config: ProxyConfig,
    pipeline: HookPipeline,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            pipeline: HookPipeline::new(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the CA manager used for interception.
    pub fn ca(&self) -> &CaManager {
        &self.config.ca_manager
    }

    /// Returns the hook pipeline shared by every connection.
    pub fn pipeline(&self) -> &HookPipeline {
        &self.pipeline
    }

    /// Installs a hook. It applies to connections already open.
    pub fn add_hook(&self, hook: Arc<dyn ProxyHook>) -> HookId {
        self.pipeline.add(hook)
    }

    /// Removes a hook. Returns false if it was not installed.
    pub fn remove_hook(&self, id: HookId) -> bool {
        self.pipeline.remove(id)
    }

    /// Starts the proxy and returns the bound address.
    ///
    /// If the engine is already running, returns its current address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return Ok(current.addr);
            }
            tracing::warn!("Proxy task exited unexpectedly, restarting");
        }

        let authority = LeafAuthority::new(self.config.ca_manager.clone())?;

        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let handler = PipelineHandler::new(
            self.pipeline.clone(),
            self.config.tracked_hosts.clone(),
            self.config.max_body_bytes,
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.config.ca_manager.cert_path());

        let handle = tokio::spawn(async move {
            if let Err(e) = proxy.start().await {
                tracing::error!("Proxy error: {}", e);
            }
            tracing::info!("Proxy server stopped");
        });

        *running = Some(Running {
            addr,
            shutdown_tx,
            handle,
        });
        Ok(addr)
    }

    /// Stops the proxy. Does nothing if it is not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        let mut handle = running.handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            tracing::warn!("Proxy connections still open after {:?}, aborting", SHUTDOWN_GRACE);
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Address the proxy is bound to, if running.
    pub async fn addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig::new(CaManager::new(temp_dir.path())).with_port(0)
    }

    #[test]
    fn proxy_config_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProxyConfig::new(CaManager::new(temp_dir.path()));
        assert_eq!(config.addr.port(), DEFAULT_PROXY_PORT);
        assert!(config.tracked_hosts.is_empty());
        assert_eq!(config.max_body_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn proxy_config_builders() {
        let temp_dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&temp_dir)
            .with_addr(addr)
            .with_tracked_hosts(["example.com"])
            .with_max_body_bytes(1024);
        assert_eq!(config.addr, addr);
        assert_eq!(config.tracked_hosts, vec!["example.com".to_string()]);
        assert_eq!(config.max_body_bytes, 1024);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(test_config(&temp_dir));

        let first = assert_ok!(engine.start().await);
        assert_ne!(first.port(), 0);
        let second = assert_ok!(engine.start().await);
        assert_eq!(first, second);
        assert!(engine.is_running().await);
        assert!(engine.ca().ca_exists());

        engine.stop().await;
        assert!(!engine.is_running().await);
        assert!(engine.addr().await.is_none());

        // Stopping twice is harmless.
        engine.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(test_config(&temp_dir));

        engine.start().await.unwrap();
        engine.stop().await;
        let addr = assert_ok!(engine.start().await);
        assert_eq!(engine.addr().await, Some(addr));
        engine.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let engine = ProxyEngine::new(test_config(&temp_dir).with_addr(addr));
        match engine.start().await {
            Err(ProxyError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {:?}", other),
        }
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn hooks_can_be_added_and_removed() {
        struct Noop;
        impl ProxyHook for Noop {}

        let temp_dir = TempDir::new().unwrap();
        let engine = ProxyEngine::new(test_config(&temp_dir));
        let id = engine.add_hook(Arc::new(Noop));
        assert_eq!(engine.pipeline().len(), 1);
        assert!(engine.remove_hook(id));
        assert!(engine.pipeline().is_empty());
    }
}
