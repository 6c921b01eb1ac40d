//! Relay Core - accounts, provider adapters and the chat gateway.
//!
//! This crate provides:
//! - The shared data model (accounts, chat requests, canonical stream events)
//! - The credential event bus used by capture sessions
//! - The account store seam and selection strategies
//! - The provider adapter contract and registry
//! - The chat gateway with auth retry and cancellation

pub mod adapter;
pub mod bus;
pub mod capture;
pub mod error;
pub mod gateway;
pub mod models;
pub mod providers;
pub mod routing;
pub mod selector;
pub mod store;

pub use adapter::{AdapterRegistry, EventSink, ProviderAdapter};
pub use bus::{CapturedArtifact, CredentialBus, HandlerId, Subscription};
pub use capture::{
    CaptureOutcome, CookieValidator, CredentialValidator, LoginTarget, TapRule, TapSource,
    ValidationResult,
};
pub use error::{AdapterError, GatewayError, Result, StoreError};
pub use gateway::{ChatGateway, ChatStream};
pub use models::{
    Account, CanonicalStreamEvent, ChatCompletion, ChatMessage, ChatOptions, ChatRequest,
    Credential, ModelInfo, Role, AUTO_MODEL,
};
pub use providers::OpenAiCompatAdapter;
pub use routing::{PriorityEntry, RoutingConfig};
pub use selector::{AccountSelector, SelectionStrategy};
pub use store::{AccountStore, MemoryAccountStore};
