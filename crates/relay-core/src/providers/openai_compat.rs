//! Adapter for upstreams that speak the OpenAI chat-completions dialect.
//!
//! The credential is either a bare bearer token or an object carrying
//! `api_key`. Streaming responses are SSE `data:` lines terminated by
//! `[DONE]`.

use async_trait::async_trait;
use futures::StreamExt;
use memchr::memchr;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::adapter::{EventSink, ProviderAdapter};
use crate::error::AdapterError;
use crate::models::{ChatRequest, Credential, ModelInfo};

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// What the decoder saw on one SSE line.
#[derive(Debug, PartialEq)]
enum Line {
    Skip,
    Done,
}

/// Incremental SSE line splitter.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    message_id_sent: bool,
}

impl SseDecoder {
    /// Feeds bytes and dispatches every complete line to `sink`.
    ///
    /// Returns true once `[DONE]` was seen.
    fn feed(&mut self, bytes: &[u8], sink: &EventSink) -> bool {
        self.buffer.extend_from_slice(bytes);
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = match std::str::from_utf8(&line) {
                Ok(s) => s.trim(),
                Err(e) => {
                    warn!("Invalid UTF-8 in upstream stream: {}", e);
                    continue;
                }
            };
            if self.handle_line(line, sink) == Line::Done {
                return true;
            }
        }
        false
    }

    fn handle_line(&mut self, line: &str, sink: &EventSink) -> Line {
        let Some(data) = line.strip_prefix("data:") else {
            return Line::Skip;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            return Line::Done;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping malformed stream fragment: {}", e);
                return Line::Skip;
            }
        };

        if let (false, Some(id)) = (self.message_id_sent, &chunk.id) {
            self.message_id_sent = true;
            let mut meta = Map::new();
            meta.insert("message_id".into(), json!(id));
            sink.metadata(meta);
        }

        for choice in chunk.choices {
            let Some(delta) = choice.delta else { continue };
            if let Some(thinking) = delta.reasoning_content {
                sink.thinking(thinking);
            }
            if let Some(content) = delta.content {
                sink.content(content);
            }
        }

        if let Some(usage) = chunk.usage.filter(|u| !u.is_null()) {
            let mut meta = Map::new();
            meta.insert("usage".into(), usage);
            sink.metadata(meta);
        }
        Line::Skip
    }
}

fn bearer(credential: &Credential) -> Result<&str, AdapterError> {
    credential
        .as_str()
        .or_else(|| credential.as_value().get("api_key").and_then(Value::as_str))
        .ok_or_else(|| AdapterError::Protocol("credential has no bearer token".into()))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AdapterError::AuthExpired);
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(AdapterError::Upstream(format!("{}: {}", status, body)));
    }
    Ok(response)
}

/// OpenAI-compatible upstream.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    provider_id: String,
    base_url: String,
    client: Client,
}

impl OpenAiCompatAdapter {
    /// Creates an adapter for `base_url` (e.g. `https://api.example.com/v1`).
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into().to_lowercase(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn get_models(&self, credential: &Credential) -> Result<Vec<ModelInfo>, AdapterError> {
        let response = self
            .client
            .get(self.url("models"))
            .bearer_auth(bearer(credential)?)
            .send()
            .await?;
        let list: ModelList = check_status(response).await?.json().await?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo::new(&self.provider_id, m.id))
            .collect())
    }

    async fn chat_completion_stream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
        sink: EventSink,
    ) -> Result<(), AdapterError> {
        let mut body = json!({
            "model": request.model_id,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }

        debug!(provider = %self.provider_id, model = %request.model_id, "Opening upstream stream");
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(bearer(credential)?)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if decoder.feed(&chunk?, &sink) {
                return Ok(());
            }
            if sink.is_closed() {
                return Ok(());
            }
        }
        // Connection closed without [DONE]; flush a trailing unterminated line.
        decoder.feed(b"\n", &sink);
        Ok(())
    }
}
