//! API request and response models.
//!
//! The chat routes speak the OpenAI wire format, extended with Relay's
//! routing fields.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use relay_core::{
    Account, CanonicalStreamEvent, ChatCompletion, ChatMessage, ChatOptions, ChatRequest,
    ModelInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Request body for POST /v1/chat/completions.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model id, or `auto`.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Pin the request to one account.
    pub account_id: Option<String>,
    /// Pin the request to one provider.
    pub provider: Option<String>,
    /// Continue an upstream conversation.
    pub conversation_id: Option<String>,
    pub search: Option<bool>,
    pub thinking: Option<bool>,
    pub temperature: Option<f32>,
}

impl ChatCompletionRequest {
    pub fn into_chat_request(self) -> ChatRequest {
        ChatRequest {
            account_id: self.account_id,
            provider_id: self.provider,
            model_id: self.model,
            messages: self.messages,
            conversation_id: self.conversation_id,
            stream: self.stream,
            options: ChatOptions {
                search: self.search,
                thinking: self.thinking,
                temperature: self.temperature,
            },
        }
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Response body for a non-streaming chat completion.
pub fn completion_body(completion: &ChatCompletion) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": completion.content,
    });
    if !completion.thinking.is_empty() {
        message["reasoning_content"] = Value::String(completion.thinking.clone());
    }

    let mut body = json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": completion.model_id,
        "provider": completion.provider_id,
        "account_id": completion.account_id,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": "stop",
        }],
    });
    if !completion.metadata.is_empty() {
        body["metadata"] = Value::Object(completion.metadata.clone());
    }
    body
}

/// Turns canonical events into `chat.completion.chunk` payloads.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    id: String,
    created: i64,
    model: String,
    provider: String,
}

impl ChunkBuilder {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            created: Utc::now().timestamp(),
            model: model.into(),
            provider: provider.into(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "provider": self.provider,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    /// SSE payload for one event.
    pub fn build(&self, event: &CanonicalStreamEvent) -> Value {
        match event {
            CanonicalStreamEvent::Content(text) => self.chunk(json!({ "content": text }), None),
            CanonicalStreamEvent::Thinking(text) => {
                self.chunk(json!({ "reasoning_content": text }), None)
            }
            CanonicalStreamEvent::Metadata(map) => {
                let mut chunk = self.chunk(json!({}), None);
                chunk["metadata"] = Value::Object(map.clone());
                chunk
            }
            CanonicalStreamEvent::Error(message) => json!({
                "id": self.id,
                "error": { "message": message, "code": "upstream_error" },
            }),
            CanonicalStreamEvent::Done => self.chunk(json!({}), Some("stop")),
        }
    }
}

/// Query parameters for provider-filtered listings.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

/// Model entry in GET /v1/models.
#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    pub name: String,
    pub supports_thinking: bool,
    pub supports_search: bool,
}

impl From<ModelInfo> for ModelEntry {
    fn from(model: ModelInfo) -> Self {
        Self {
            id: model.id,
            object: "model",
            owned_by: model.provider_id,
            name: model.name,
            supports_thinking: model.supports_thinking,
            supports_search: model.supports_search,
        }
    }
}

/// Response body for GET /v1/models.
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// Account entry in GET /api/accounts. Credentials are never returned.
#[derive(Debug, Serialize)]
pub struct AccountEntry {
    pub id: String,
    pub provider_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage_count: u64,
}

impl AccountEntry {
    pub fn new(account: Account, usage_count: u64) -> Self {
        Self {
            id: account.id,
            provider_id: account.provider_id,
            email: account.email,
            created_at: account.created_at,
            updated_at: account.updated_at,
            usage_count,
        }
    }
}

/// Response body for GET /api/accounts.
#[derive(Debug, Serialize)]
pub struct AccountsResponse {
    pub accounts: Vec<AccountEntry>,
    pub total: usize,
}

/// Response body for GET /api/accounts/usage.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub usage: HashMap<String, u64>,
}

/// Response body for mutating admin routes.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
