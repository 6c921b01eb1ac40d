//! Error types for the gateway, adapters and account stores.

use thiserror::Error;

/// Errors raised by an account store backend.
#[derive(Debug, Error)]
#[error("account store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    /// Wraps any displayable backend error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Errors surfaced by a provider adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The upstream session is no longer valid.
    ///
    /// The gateway reacts to this variant with a single refresh-and-retry.
    #[error("upstream authentication expired")]
    AuthExpired,

    /// The upstream answered with something the adapter cannot parse.
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The adapter does not implement the requested capability.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Upstream returned an explicit error.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl AdapterError {
    /// Returns true if this error signals an expired session.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, AdapterError::AuthExpired)
    }
}

/// Errors raised while resolving or dispatching a chat request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No credentialed account could be resolved for the request.
    #[error("no account available for {0}")]
    NoAccountAvailable(String),

    /// An explicit account id was given but does not exist.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// An explicit account belongs to a different provider than requested.
    #[error("account {account} belongs to {actual}, not {requested}")]
    AccountProviderMismatch {
        account: String,
        actual: String,
        requested: String,
    },

    /// No adapter is registered for the resolved provider.
    #[error("no adapter registered for provider: {0}")]
    AdapterNotFound(String),

    /// The model could not be mapped to a provider.
    #[error("cannot infer provider for model: {0}")]
    UnknownModel(String),

    /// Account store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Adapter failure outside of a stream (e.g. model listing).
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The upstream call ended with an error event.
    #[error("upstream failed: {0}")]
    Upstream(String),

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
