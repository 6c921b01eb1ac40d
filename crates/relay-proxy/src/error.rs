//! Error types for the proxy and capture sessions.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// The listening socket could not be bound.
    #[error("failed to bind proxy to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate a certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read certificate material.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse certificate material.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write certificate material.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Hostname cannot be used as a certificate file name.
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Failed to build a TLS server configuration.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Capture session error type.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No artifact validated before the deadline.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    /// The browser closed and the final validation pass found nothing usable.
    #[error("browser exited before a credential was captured")]
    BrowserExited,

    /// Another capture session is already running.
    #[error("a capture session is already in progress")]
    Busy,

    /// The browser process could not be started.
    #[error("failed to launch browser: {0}")]
    Spawn(String),

    /// The proxy engine could not be started.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Browser profile directory handling failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
