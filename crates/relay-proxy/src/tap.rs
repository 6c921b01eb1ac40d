//! Proxy hook that publishes matching traffic to the credential bus.

use async_trait::async_trait;
use http::header::COOKIE;
use http::HeaderMap;
use relay_core::{CredentialBus, TapRule, TapSource};
use serde_json::{Map, Value};

use crate::hooks::{ProxyHook, RequestContext, ResponseContext};

/// Publishes cookies, headers or response bodies selected by [`TapRule`]s.
#[derive(Debug, Clone)]
pub struct CaptureTap {
    bus: CredentialBus,
    rules: Vec<TapRule>,
}

impl CaptureTap {
    pub fn new(bus: CredentialBus, rules: Vec<TapRule>) -> Self {
        Self { bus, rules }
    }

    /// Host suffixes this tap needs bodies from.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !hosts.contains(&rule.host_suffix) {
                hosts.push(rule.host_suffix.clone());
            }
        }
        hosts
    }

    fn matching<'a>(
        &'a self,
        ctx: &'a RequestContext,
        source: TapSource,
    ) -> impl Iterator<Item = &'a TapRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.source == source && rule.matches(&ctx.host, ctx.path()))
    }
}

/// Joins every `Cookie` header into one `name=value; ...` string.
fn cookie_string(headers: &HeaderMap) -> Option<String> {
    let parts: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// Header map as a JSON object; repeated headers are comma-joined.
fn header_object(headers: &HeaderMap) -> Value {
    let mut object = Map::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        object.insert(name.as_str().to_string(), Value::String(values.join(", ")));
    }
    Value::Object(object)
}

#[async_trait]
impl ProxyHook for CaptureTap {
    async fn on_request(&self, ctx: &mut RequestContext) {
        for rule in self.matching(ctx, TapSource::RequestCookies) {
            if let Some(cookies) = cookie_string(&ctx.headers) {
                tracing::debug!(event = %rule.event, host = %ctx.host, "Captured cookies");
                self.bus.emit(&rule.event, Value::String(cookies));
            }
        }

        for rule in self.matching(ctx, TapSource::RequestHeaders) {
            tracing::debug!(event = %rule.event, host = %ctx.host, "Captured request headers");
            self.bus.emit(&rule.event, header_object(&ctx.headers));
        }
    }

    async fn on_response_body(&self, ctx: &ResponseContext, body: &[u8]) {
        for rule in self.matching(&ctx.request, TapSource::ResponseBody) {
            let payload = serde_json::from_slice::<Value>(body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
            tracing::debug!(
                event = %rule.event,
                host = %ctx.request.host,
                bytes = body.len(),
                "Captured response body"
            );
            self.bus.emit(&rule.event, payload);
        }
    }
}
