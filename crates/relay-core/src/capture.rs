//! Capture contract between providers and the capture orchestrator.
//!
//! Providers describe where to log in and which traffic to tap, and supply a
//! validator that turns captured artifacts into a confirmed identity.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::CapturedArtifact;
use crate::models::Credential;

/// Where a tap reads its payload from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapSource {
    /// The request `Cookie` header, published as a string.
    RequestCookies,
    /// All request headers, published as a JSON object.
    RequestHeaders,
    /// The decoded response body, published as JSON when it parses.
    ResponseBody,
}

/// Publishes matching traffic to the credential bus under `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapRule {
    pub host_suffix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_contains: Option<String>,
    pub event: String,
    pub source: TapSource,
}

impl TapRule {
    pub fn new(host_suffix: impl Into<String>, event: impl Into<String>, source: TapSource) -> Self {
        Self {
            host_suffix: host_suffix.into(),
            path_contains: None,
            event: event.into(),
            source,
        }
    }

    pub fn with_path(mut self, fragment: impl Into<String>) -> Self {
        self.path_contains = Some(fragment.into());
        self
    }

    /// Returns true if the rule applies to `host` and `path`.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let suffix = self.host_suffix.to_ascii_lowercase();
        let host_ok = host == suffix || host.ends_with(&format!(".{}", suffix));
        let path_ok = self
            .path_contains
            .as_deref()
            .is_none_or(|fragment| path.contains(fragment));
        host_ok && path_ok
    }
}

/// Recipe for capturing a provider session through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginTarget {
    pub login_url: String,
    pub taps: Vec<TapRule>,
}

impl LoginTarget {
    /// Distinct event names published by the taps, in declaration order.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = Vec::new();
        for tap in &self.taps {
            if !events.contains(&tap.event) {
                events.push(tap.event.clone());
            }
        }
        events
    }
}

/// A confirmed identity produced by a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub credential: Credential,
    pub email: String,
    pub headers: BTreeMap<String, String>,
}

/// Result of validating one artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The artifact yields a working session.
    Confirmed(CaptureOutcome),
    /// Not usable yet; the session keeps listening.
    Rejected(String),
}

/// Provider-supplied predicate run against every captured artifact.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, artifact: &CapturedArtifact) -> ValidationResult;
}

/// Confirms a cookie string once every required cookie name is present.
///
/// Without a configured email the identity is `session-<digest>`, a digest
/// of the required cookie values. Distinct sessions get distinct accounts
/// and the cookie values never appear in the identity.
#[derive(Debug, Clone)]
pub struct CookieValidator {
    required: Vec<String>,
    email: Option<String>,
}

impl CookieValidator {
    pub fn new(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    fn identity(&self, cookies: &BTreeMap<String, String>) -> String {
        if let Some(email) = &self.email {
            return email.clone();
        }
        let mut hasher = DefaultHasher::new();
        for name in &self.required {
            name.hash(&mut hasher);
            cookies.get(name).hash(&mut hasher);
        }
        format!("session-{:016x}", hasher.finish())
    }
}

/// Parses a `Cookie` header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[async_trait]
impl CredentialValidator for CookieValidator {
    async fn validate(&self, artifact: &CapturedArtifact) -> ValidationResult {
        let Some(header) = artifact.payload.as_str() else {
            return ValidationResult::Rejected("payload is not a cookie string".into());
        };

        let cookies = parse_cookie_header(header);
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| cookies.get(name.as_str()).is_none_or(|v| v.is_empty()))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return ValidationResult::Rejected(format!("missing cookies: {}", missing.join(", ")));
        }

        ValidationResult::Confirmed(CaptureOutcome {
            credential: Credential::new(Value::String(header.to_string())),
            email: self.identity(&cookies),
            headers: BTreeMap::new(),
        })
    }
}
