//! HTTP handler that runs the hook pipeline over intercepted traffic.
//!
//! Request headers and response headers are offered to every hook for all
//! hosts. Bodies are only inspected for tracked hosts, and only when they are
//! small enough and of a textual type; everything else streams through
//! untouched. Inspected response bodies are teed: the client receives each
//! frame as it arrives while a copy is collected for the body hooks.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::{Bytes, Frame};
use tokio::sync::mpsc;

use crate::decode::{bytes_to_body, decode_body, is_multipart, is_textual};
use crate::hooks::{HookPipeline, RequestContext, ResponseContext};

/// Largest body, in bytes, buffered for hook inspection.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Frames in flight between the upstream reader and the client.
const TEE_FRAMES: usize = 16;

type FrameResult = Result<Frame<Bytes>, hudsucker::Error>;

/// Client side of a teed response body.
struct FrameReceiver(mpsc::Receiver<FrameResult>);

impl Stream for FrameReceiver {
    type Item = FrameResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.poll_recv(cx)
    }
}

fn bad_gateway(message: &'static str) -> Response<Body> {
    let mut res = Response::new(Body::from(message));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

/// Forwards `body` frame by frame to `tx`, keeping a copy of up to
/// `max_body_bytes`. Body hooks run once the upstream finishes, before the
/// client's stream is closed.
async fn tee_response(
    mut body: Body,
    tx: mpsc::Sender<FrameResult>,
    pipeline: HookPipeline,
    ctx: ResponseContext,
    headers: HeaderMap,
    max_body_bytes: usize,
) {
    let mut captured: Option<Vec<u8>> = Some(Vec::new());

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to read response body from {}: {}", ctx.request.host, e);
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        if let Some(data) = frame.data_ref() {
            let over = captured
                .as_ref()
                .is_some_and(|buf| buf.len() + data.len() > max_body_bytes);
            if over {
                tracing::warn!(
                    "Response from {} exceeds {} bytes, skipping body hooks",
                    ctx.request.host,
                    max_body_bytes
                );
                captured = None;
            } else if let Some(buf) = captured.as_mut() {
                buf.extend_from_slice(data);
            }
        }

        if tx.send(Ok(frame)).await.is_err() {
            tracing::debug!("Client closed response from {}", ctx.request.host);
            return;
        }
    }

    let Some(raw) = captured else {
        return;
    };
    let raw = Bytes::from(raw);
    let decoded = match decode_body(&headers, raw.clone()).await {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!("Failed to decode response from {}: {}", ctx.request.host, e);
            raw
        }
    };
    pipeline.run_response_body(&ctx, &decoded).await;
}

/// Returns true if `host` equals or is a subdomain of a tracked suffix.
/// An empty list tracks every host.
pub(crate) fn is_tracked_host(tracked: &[String], host: &str) -> bool {
    if tracked.is_empty() {
        return true;
    }
    let host = host.to_ascii_lowercase();
    tracked.iter().any(|t| {
        let t = t.trim_start_matches('.').to_ascii_lowercase();
        host == t || host.ends_with(&format!(".{}", t))
    })
}

/// HTTP handler for the MITM proxy.
///
/// hudsucker clones the handler for every request, so the request context
/// stored by `handle_request` is the one seen by the matching response.
#[derive(Clone, Debug)]
pub struct PipelineHandler {
    pipeline: HookPipeline,
    tracked_hosts: Arc<Vec<String>>,
    max_body_bytes: usize,
    request: Option<RequestContext>,
}

impl PipelineHandler {
    /// Creates a handler. An empty `tracked_hosts` list tracks every host.
    pub fn new(pipeline: HookPipeline, tracked_hosts: Vec<String>, max_body_bytes: usize) -> Self {
        let tracked_hosts = tracked_hosts
            .into_iter()
            .map(|h| h.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            pipeline,
            tracked_hosts: Arc::new(tracked_hosts),
            max_body_bytes,
            request: None,
        }
    }

    /// Returns true if bodies exchanged with `host` are buffered for hooks.
    pub fn is_tracked(&self, host: &str) -> bool {
        is_tracked_host(&self.tracked_hosts, host)
    }

    /// Extracts host from request URI or Host header.
    fn extract_host(req: &Request<Body>) -> Option<String> {
        if let Some(host) = req.uri().host() {
            return Some(host.to_ascii_lowercase());
        }

        req.headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(':').next().unwrap_or(s).to_ascii_lowercase())
    }

    fn declared_length(headers: &http::HeaderMap) -> Option<usize> {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Runs request hooks and returns the request to forward.
    pub async fn process_request(&mut self, req: Request<Body>) -> RequestOrResponse {
        self.request = None;

        // Tunnel setup is not an exchange hooks care about.
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(host) = Self::extract_host(&req) else {
            return RequestOrResponse::Request(req);
        };

        let (mut parts, body) = req.into_parts();
        let mut ctx = RequestContext {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            host,
            headers: parts.headers.clone(),
        };

        self.pipeline.run_request(&mut ctx).await;
        parts.headers = ctx.headers.clone();

        let buffer = self.is_tracked(&ctx.host)
            && !is_multipart(&parts.headers)
            && Self::declared_length(&parts.headers).is_none_or(|len| len <= self.max_body_bytes);

        let body = if buffer {
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::warn!("Failed to read request body for {}: {}", ctx.host, e);
                    let response = bad_gateway("request body could not be read");
                    return RequestOrResponse::Response(response);
                }
            };
            if !bytes.is_empty() && bytes.len() <= self.max_body_bytes {
                self.pipeline.run_request_data(&ctx, &bytes).await;
            }
            bytes_to_body(bytes)
        } else {
            body
        };

        self.request = Some(ctx);
        RequestOrResponse::Request(Request::from_parts(parts, body))
    }

    /// Runs response hooks and returns the response to forward.
    ///
    /// The client always receives the original bytes as they arrive; hooks see
    /// a decoded copy once the body is complete.
    pub async fn process_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(request) = self.request.take() else {
            return res;
        };

        let (mut parts, body) = res.into_parts();
        let mut ctx = ResponseContext {
            request,
            status: parts.status,
            headers: parts.headers.clone(),
        };

        self.pipeline.run_response(&mut ctx).await;
        parts.headers = ctx.headers.clone();

        if !self.is_tracked(&ctx.request.host) || !is_textual(&parts.headers) {
            return Response::from_parts(parts, body);
        }

        if Self::declared_length(&parts.headers).is_some_and(|len| len > self.max_body_bytes) {
            tracing::warn!(
                "Response from {} exceeds {} bytes, skipping body hooks",
                ctx.request.host,
                self.max_body_bytes
            );
            return Response::from_parts(parts, body);
        }

        let (tx, rx) = mpsc::channel(TEE_FRAMES);
        tokio::spawn(tee_response(
            body,
            tx,
            self.pipeline.clone(),
            ctx,
            parts.headers.clone(),
            self.max_body_bytes,
        ));

        Response::from_parts(parts, Body::from(StreamBody::new(FrameReceiver(rx))))
    }
}

impl HttpHandler for PipelineHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.process_request(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.process_response(res).await
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        // Untracked hosts are tunnelled without TLS interception.
        Self::extract_host(req).is_some_and(|host| self.is_tracked(&host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::ProxyHook;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures::stream;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;

    #[derive(Default)]
    struct Spy {
        request_data: Mutex<Vec<Vec<u8>>>,
        response_bodies: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<usize>,
    }

    #[async_trait]
    impl ProxyHook for Spy {
        async fn on_request(&self, ctx: &mut RequestContext) {
            ctx.headers.insert("x-relay", "1".parse().unwrap());
            ctx.headers.remove("x-drop-me");
        }

        async fn on_request_data(&self, _ctx: &RequestContext, data: &[u8]) {
            self.request_data.lock().push(data.to_vec());
        }

        async fn on_response(&self, ctx: &mut ResponseContext) {
            *self.responses.lock() += 1;
            ctx.headers.insert("x-inspected", "yes".parse().unwrap());
        }

        async fn on_response_body(&self, _ctx: &ResponseContext, body: &[u8]) {
            self.response_bodies.lock().push(body.to_vec());
        }
    }

    fn handler_with(spy: Arc<Spy>, tracked: Vec<String>, max: usize) -> PipelineHandler {
        let pipeline = HookPipeline::new();
        pipeline.add(spy);
        PipelineHandler::new(pipeline, tracked, max)
    }

    fn request(host: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/api", host))
            .header("x-drop-me", "secret")
            .header("content-type", "application/json")
            .body(bytes_to_body(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_bytes(body: Body) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn request_header_edits_are_forwarded() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);

        let forwarded = match handler.process_request(request("example.com", b"{\"a\":1}")).await {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("expected request"),
        };

        assert_eq!(forwarded.headers().get("x-relay").unwrap(), "1");
        assert!(forwarded.headers().get("x-drop-me").is_none());
        assert_eq!(body_bytes(forwarded.into_body()).await.as_ref(), b"{\"a\":1}");
        assert_eq!(*spy.request_data.lock(), vec![b"{\"a\":1}".to_vec()]);
    }

    #[tokio::test]
    async fn untracked_hosts_skip_body_hooks() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec!["example.com".into()], DEFAULT_MAX_BODY_BYTES);

        let forwarded = match handler.process_request(request("other.org", b"{}")).await {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("expected request"),
        };

        // Header hooks still run everywhere.
        assert_eq!(forwarded.headers().get("x-relay").unwrap(), "1");
        assert!(spy.request_data.lock().is_empty());
        assert!(handler.is_tracked("api.example.com"));
        assert!(!handler.is_tracked("example.com.evil.net"));
    }

    #[tokio::test]
    async fn gzip_response_is_decoded_for_hooks_only() {
        let payload = br#"{"email":"me@example.com"}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);
        handler.process_request(request("example.com", b"")).await;

        let response = Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(bytes_to_body(compressed.clone()))
            .unwrap();

        let forwarded = handler.process_response(response).await;
        assert_eq!(forwarded.headers().get("x-inspected").unwrap(), "yes");
        assert_eq!(forwarded.headers().get("content-encoding").unwrap(), "gzip");
        assert_eq!(body_bytes(forwarded.into_body()).await, compressed);
        assert_eq!(*spy.response_bodies.lock(), vec![payload.to_vec()]);
    }

    #[tokio::test]
    async fn oversize_response_is_forwarded_without_body_hooks() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], 8);
        handler.process_request(request("example.com", b"")).await;

        let response = Response::builder()
            .header("content-type", "text/plain")
            .body(bytes_to_body(Bytes::from_static(b"0123456789abcdef")))
            .unwrap();

        let forwarded = handler.process_response(response).await;
        assert_eq!(body_bytes(forwarded.into_body()).await.as_ref(), b"0123456789abcdef");
        assert_eq!(*spy.responses.lock(), 1);
        assert!(spy.response_bodies.lock().is_empty());
    }

    #[tokio::test]
    async fn oversize_chunked_response_skips_body_hooks() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], 8);
        handler.process_request(request("example.com", b"")).await;

        let chunks = stream::iter([
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"4567")),
            Ok(Bytes::from_static(b"89")),
        ]);
        let response = Response::builder()
            .header("content-type", "application/json")
            .body(Body::from_stream(chunks))
            .unwrap();

        let forwarded = handler.process_response(response).await;
        assert_eq!(body_bytes(forwarded.into_body()).await.as_ref(), b"0123456789");
        assert!(spy.response_bodies.lock().is_empty());
    }

    #[tokio::test]
    async fn pending_text_response_is_forwarded_as_it_arrives() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);
        handler.process_request(request("example.com", b"")).await;

        // One frame, then the upstream keeps the connection open.
        let first = Bytes::from_static(b"first chunk of text");
        let chunks = stream::iter([Ok::<_, std::io::Error>(first)]).chain(stream::pending());
        let response = Response::builder()
            .header("content-type", "text/plain")
            .body(Body::from_stream(chunks))
            .unwrap();

        let forwarded = handler.process_response(response);
        let forwarded = tokio::time::timeout(Duration::from_secs(2), forwarded)
            .await
            .expect("response headers should not wait for the body");

        let mut body = forwarded.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("first frame should reach the client")
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"first chunk of text");
        assert!(spy.response_bodies.lock().is_empty());
    }

    #[tokio::test]
    async fn unreadable_request_body_is_bad_gateway() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);

        let broken = stream::iter([Err::<Bytes, _>(std::io::Error::other("connection reset"))]);
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://example.com/api")
            .header("content-type", "application/json")
            .body(Body::from_stream(broken))
            .unwrap();

        match handler.process_request(req).await {
            RequestOrResponse::Response(res) => assert_eq!(res.status(), StatusCode::BAD_GATEWAY),
            RequestOrResponse::Request(_) => panic!("expected an error response"),
        }
        assert!(spy.request_data.lock().is_empty());
    }

    #[tokio::test]
    async fn event_streams_pass_through() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);
        handler.process_request(request("example.com", b"")).await;

        let response = Response::builder()
            .header("content-type", "text/event-stream")
            .body(bytes_to_body(Bytes::from_static(b"data: hi\n\n")))
            .unwrap();

        let forwarded = handler.process_response(response).await;
        assert_eq!(body_bytes(forwarded.into_body()).await.as_ref(), b"data: hi\n\n");
        assert!(spy.response_bodies.lock().is_empty());
    }

    #[tokio::test]
    async fn connect_requests_bypass_hooks() {
        let spy = Arc::new(Spy::default());
        let mut handler = handler_with(spy.clone(), vec![], DEFAULT_MAX_BODY_BYTES);

        let connect = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();

        match handler.process_request(connect).await {
            RequestOrResponse::Request(req) => assert!(req.headers().get("x-relay").is_none()),
            RequestOrResponse::Response(_) => panic!("expected request"),
        }

        // No stored request, so the response is untouched.
        let response = Response::builder().body(Body::empty()).unwrap();
        let forwarded = handler.process_response(response).await;
        assert!(forwarded.headers().get("x-inspected").is_none());
        assert_eq!(*spy.responses.lock(), 0);
    }
}
