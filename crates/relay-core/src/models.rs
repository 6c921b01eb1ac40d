//! Data model shared by the gateway, the stores and the capture machinery.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque provider-defined credential.
///
/// A cookie string, a structured token or a JWT set. Only the adapter for the
/// owning provider interprets it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(Value);

impl Credential {
    /// Wraps an arbitrary JSON credential.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Wraps a plain string credential (cookie header, bearer token).
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(Value::String(text.into()))
    }

    /// Returns the credential as a string if it is one.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Returns the raw JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the credential into its JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

// Credentials must never end up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A stored, provider-scoped credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier.
    pub id: String,
    /// Lowercase provider identifier.
    pub provider_id: String,
    /// Identity the credential belongs to.
    pub email: String,
    /// Provider-defined credential.
    pub credential: Credential,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last credential update.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Creates a new account with a fresh id.
    pub fn new(provider_id: &str, email: impl Into<String>, credential: Credential) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_id: provider_id.to_lowercase(),
            email: email.into(),
            credential,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the credential after a token refresh.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self.updated_at = Utc::now();
        self
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Optional generation switches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Model id that asks the gateway to pick provider and model itself.
pub const AUTO_MODEL: &str = "auto";

/// An incoming chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub options: ChatOptions,
}

impl ChatRequest {
    /// Creates a streaming request for a model.
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            account_id: None,
            provider_id: None,
            model_id: model_id.into(),
            messages,
            conversation_id: None,
            stream: true,
            options: ChatOptions::default(),
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Returns true if the model should be resolved automatically.
    pub fn is_auto(&self) -> bool {
        self.model_id.eq_ignore_ascii_case(AUTO_MODEL)
    }
}

/// Normalized stream event produced by the gateway.
///
/// `Done` and `Error` are terminal: nothing follows them for the same request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CanonicalStreamEvent {
    Content(String),
    Thinking(String),
    Metadata(Map<String, Value>),
    Error(String),
    Done,
}

impl CanonicalStreamEvent {
    /// Returns true for `Done` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// Model advertised by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    #[serde(default)]
    pub supports_thinking: bool,
    #[serde(default)]
    pub supports_search: bool,
}

impl ModelInfo {
    pub fn new(provider_id: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider_id: provider_id.to_string(),
            supports_thinking: false,
            supports_search: false,
        }
    }
}

/// Buffered result of a non-streaming chat request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub account_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Upstream conversation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Upstream conversation with its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
}

/// File uploaded to an upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}
