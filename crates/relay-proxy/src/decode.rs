//! Body classification and content decoding for hook dispatch.

use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hudsucker::hyper::Response;
use hudsucker::Body;

use crate::error::{ProxyError, Result};

/// Helper to convert bytes to Body
pub(crate) fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
}

/// True for textual content types whose bodies hooks may inspect.
///
/// Event streams are excluded: they are forwarded as they arrive.
pub fn is_textual(headers: &HeaderMap) -> bool {
    let Some(content_type) = content_type(headers) else {
        return false;
    };
    let mime = content_type.split(';').next().unwrap_or_default().trim();

    if mime == "text/event-stream" {
        return false;
    }
    mime.starts_with("text/")
        || mime == "application/json"
        || mime.ends_with("+json")
        || mime == "application/javascript"
        || mime == "application/x-www-form-urlencoded"
        || mime == "application/graphql"
        || mime.ends_with("/xml")
        || mime.ends_with("+xml")
}

/// True for multipart bodies (file uploads), which are never buffered.
pub fn is_multipart(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| ct.starts_with("multipart/"))
}

/// Removes any `Content-Encoding` from `raw`.
///
/// gzip, deflate, brotli and zstd are handled by hudsucker's decoder.
pub async fn decode_body(headers: &HeaderMap, raw: Bytes) -> Result<Bytes> {
    let encoding = match headers.get(CONTENT_ENCODING) {
        Some(value) => value.clone(),
        None => return Ok(raw),
    };
    if encoding
        .to_str()
        .is_ok_and(|e| e.trim().eq_ignore_ascii_case("identity"))
    {
        return Ok(raw);
    }

    let response = Response::builder()
        .header(CONTENT_ENCODING, encoding)
        .body(bytes_to_body(raw))
        .map_err(|e| ProxyError::Http(e.to_string()))?;

    let decoded =
        hudsucker::decode_response(response).map_err(|e| ProxyError::Http(e.to_string()))?;

    decoded
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::Http(e.to_string()))
}
