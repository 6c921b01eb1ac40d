//! Relay Proxy - MITM capture proxy and login orchestration.
//!
//! This crate provides the credential capture side of Relay: an intercepting
//! HTTPS proxy that runs a hook pipeline over browser traffic, and a capture
//! orchestrator that drives a throwaway browser profile through it until a
//! provider validator confirms a working session.
//!
//! ## Features
//!
//! - Generates the root CA on first run and one leaf certificate per host
//! - Runs ordered hooks on request headers, request bodies, response headers
//!   and decoded response bodies
//! - Buffers bodies only for tracked hosts and only below a size cap
//! - Publishes tapped cookies, headers and bodies on the credential bus
//! - Serializes capture sessions and cleans up the browser profile on every exit
//!
//! ## Architecture
//!
//! ```text
//! Browser ──► ProxyEngine ──► HookPipeline ──► CaptureTap ──► CredentialBus
//!                                                                   │
//!                               CaptureOrchestrator ◄── validator ◄─┘
//! ```

mod browser;
mod ca;
mod capture;
mod decode;
mod error;
mod handler;
mod hooks;
mod proxy;
mod tap;

pub use browser::{BrowserLaunch, BrowserSpawner, ChromiumBrowser};
pub use ca::{CaManager, CaManagerError, CaPaths, LeafAuthority, LeafPaths};
pub use capture::{CaptureConfig, CaptureOrchestrator, LoginRequest, DEFAULT_CAPTURE_DEADLINE};
pub use decode::{decode_body, is_multipart, is_textual};
pub use error::{CaptureError, ProxyError, Result};
pub use handler::{PipelineHandler, DEFAULT_MAX_BODY_BYTES};
pub use hooks::{HookId, HookPipeline, ProxyHook, RequestContext, ResponseContext};
pub use proxy::{ProxyConfig, ProxyEngine};
pub use tap::CaptureTap;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8766);
    }
}
