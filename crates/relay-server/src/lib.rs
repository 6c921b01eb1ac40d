//! Relay Server - HTTP API server.
//!
//! This crate provides the HTTP front door of Relay: an OpenAI-style chat
//! API backed by the chat gateway, plus account administration routes.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion (SSE when `stream: true`)
//! - `GET /v1/models` - Models of providers with a stored account
//! - `GET /api/accounts` - Stored accounts (credentials omitted)
//! - `DELETE /api/accounts/{id}` - Delete an account
//! - `GET /api/accounts/usage` - Per-account request counters
//! - `POST /api/accounts/usage/reset` - Clear request counters and round-robin cursors
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_core::AdapterRegistry;
//! use relay_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(AdapterRegistry::new());
//!     let server = Server::new(ServerConfig::default(), registry).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use relay_core::AdapterRegistry;
use relay_storage::Database;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 48765;

/// Default server host (localhost only for security).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 48765).
    pub port: u16,
    /// Database path (None = in-memory).
    pub db_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db_path: None,
        }
    }
}

impl ServerConfig {
    /// Creates a config with a specific database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] relay_storage::StorageError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/api/accounts", get(handlers::list_accounts))
        .route("/api/accounts/usage", get(handlers::get_usage))
        .route("/api/accounts/usage/reset", post(handlers::reset_usage))
        .route("/api/accounts/{id}", delete(handlers::delete_account))
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server, opening the configured database.
    pub fn new(
        config: ServerConfig,
        registry: Arc<AdapterRegistry>,
    ) -> std::result::Result<Self, ServerError> {
        let db = match &config.db_path {
            Some(path) => Database::with_path(path)?,
            None => Database::in_memory()?,
        };

        let state = AppState::with_database(db, registry)?;
        Self::with_state(config, state)
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        // Local tools and browser front-ends call from arbitrary origins.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = router(state).layer(cors);

        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Binds the listening socket with `SO_REUSEADDR`.
    fn bind(&self) -> std::result::Result<tokio::net::TcpListener, ServerError> {
        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Starting Relay API server on {}", self.addr);
        let listener = self.bind()?;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("Relay API server stopped");
        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use relay_core::{
        Account, AccountSelector, AdapterError, ChatGateway, ChatRequest, Credential, EventSink,
        MemoryAccountStore, ModelInfo, ProviderAdapter, RoutingConfig, SelectionStrategy,
    };
    use serde_json::json;
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    struct Scripted;

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn provider_id(&self) -> &str {
            "mock"
        }

        async fn get_models(
            &self,
            _credential: &Credential,
        ) -> std::result::Result<Vec<ModelInfo>, AdapterError> {
            Ok(vec![ModelInfo::new("mock", "mock-1")])
        }

        async fn chat_completion_stream(
            &self,
            _credential: &Credential,
            _request: &ChatRequest,
            sink: EventSink,
        ) -> std::result::Result<(), AdapterError> {
            sink.content("Hello");
            sink.content(" world");
            Ok(())
        }
    }

    fn create_test_app(accounts: Vec<Account>) -> (Router, AppState) {
        let store = Arc::new(MemoryAccountStore::with_accounts(accounts));
        let selector = Arc::new(AccountSelector::new(store));
        let registry = Arc::new(AdapterRegistry::new());
        registry.register(Arc::new(Scripted));
        let routing = RoutingConfig::default().with_model("mock-1", "mock");
        let state = AppState::new(Arc::new(ChatGateway::new(selector, registry, routing)));
        (router(state.clone()), state)
    }

    fn mock_account() -> Account {
        Account::new("mock", "me@example.com", Credential::from_text("secret-cookie"))
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_chat_completion_json() {
        let (app, _) = create_test_app(vec![mock_account()]);

        let response = app
            .oneshot(chat_request(json!({
                "model": "mock-1",
                "messages": [{"role": "user", "content": "hi"}],
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(json["provider"], "mock");
    }

    #[tokio::test]
    async fn test_chat_completion_sse() {
        let (app, _) = create_test_app(vec![mock_account()]);

        let response = app
            .oneshot(chat_request(json!({
                "model": "mock-1",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();

        assert_eq!(data.len(), 4);
        let first: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(data[1]).unwrap();
        let last: serde_json::Value = serde_json::from_str(data[2]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(second["choices"][0]["delta"]["content"], " world");
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(data[3], "[DONE]");
    }

    #[tokio::test]
    async fn test_no_account_is_service_unavailable() {
        let (app, _) = create_test_app(vec![]);

        let response = app
            .oneshot(chat_request(json!({
                "model": "mock-1",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["code"], "no_account_available");
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let (app, _) = create_test_app(vec![mock_account()]);

        let response = app
            .oneshot(chat_request(json!({"model": "mock-1", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_models() {
        let (app, _) = create_test_app(vec![mock_account()]);

        let request = Request::builder()
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "mock-1");
        assert_eq!(json["data"][0]["owned_by"], "mock");
    }

    #[tokio::test]
    async fn test_list_accounts_hides_credentials() {
        let (app, _) = create_test_app(vec![mock_account()]);

        let request = Request::builder()
            .uri("/api/accounts")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["accounts"][0]["email"], "me@example.com");
        assert!(!json.to_string().contains("secret-cookie"));
    }

    #[tokio::test]
    async fn test_delete_account() {
        let account = mock_account();
        let id = account.id.clone();
        let (app, state) = create_test_app(vec![account]);

        let request = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/accounts/{}", id))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.selector().store().get(&id).unwrap().is_none());

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_usage_and_reset() {
        let account = mock_account();
        let id = account.id.clone();
        let (app, state) = create_test_app(vec![account]);

        app.clone()
            .oneshot(chat_request(json!({
                "model": "mock-1",
                "messages": [{"role": "user", "content": "hi"}],
            })))
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/api/accounts/usage")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(json["usage"][&id], 1);

        let request = Request::builder()
            .method("POST")
            .uri("/api/accounts/usage/reset")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.selector().usage_counts().is_empty());
    }

    #[tokio::test]
    async fn test_reset_rewinds_round_robin() {
        let accounts = vec![
            mock_account(),
            Account::new("mock", "other@example.com", Credential::from_text("c")),
        ];
        let (app, state) = create_test_app(accounts);
        let pick = || {
            state
                .selector()
                .select_account(Some("mock"), SelectionStrategy::RoundRobin, None)
                .unwrap()
                .unwrap()
                .id
        };

        let first = pick();
        let second = pick();
        assert_ne!(first, second);

        let request = Request::builder()
            .method("POST")
            .uri("/api/accounts/usage/reset")
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap();

        assert_eq!(pick(), first);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_server_config_with_port() {
        let config = ServerConfig::default().with_port(9000);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_server_opens_in_memory_database() {
        let registry = Arc::new(AdapterRegistry::new());
        let server = assert_ok!(Server::new(ServerConfig::default().with_port(0), registry));
        assert_eq!(server.addr().port(), 0);
    }
}
