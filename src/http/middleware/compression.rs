//! On-the-fly gzip compression.
//!
//! # Responsibilities
//! - Decide once per response, from the response head, whether to compress
//! - Stream the body through a gzip encoder writing into a pooled buffer
//! - Settle the encoder's pool loan exactly once, even when the client goes
//!   away mid-stream
//!
//! # Design Decisions
//! - Already-encoded responses (precompressed sidecars, upstream gzip) pass
//!   through byte for byte
//! - Every input chunk is sync-flushed so streamed responses (SSE, long
//!   polls) reach the client without waiting for more data
//! - Upgrade handshakes are never wrapped

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    body::{Body, BodyDataStream},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode},
    middleware::Next,
};
use bytes::Bytes;
use flate2::write::GzEncoder;
use futures_util::{stream, StreamExt};

/// Content types worth compressing. Compared against the primary type only.
pub const COMPRESSIBLE_TYPES: &[&str] = &[
    "text/html",
    "text/css",
    "text/plain",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "application/json",
    "application/xml",
    "text/xml",
    "image/svg+xml",
];

const MAX_IDLE_BUFFERS: usize = 64;

/// Gzip encoders writing into pooled output buffers.
#[derive(Debug)]
pub struct EncoderPool {
    level: flate2::Compression,
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl EncoderPool {
    pub fn new(level: flate2::Compression) -> Arc<Self> {
        Arc::new(Self {
            level,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    fn acquire(self: &Arc<Self>) -> PooledEncoder {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_default();
        PooledEncoder {
            encoder: Some(GzEncoder::new(buf, self.level)),
            pool: self.clone(),
        }
    }

    fn release(&self, buf: Option<Vec<u8>>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let Some(mut buf) = buf else {
            return;
        };
        buf.clear();
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }

    /// Encoders currently lent out to in-flight responses.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Output buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A gzip encoder on loan from an [`EncoderPool`].
struct PooledEncoder {
    encoder: Option<GzEncoder<Vec<u8>>>,
    pool: Arc<EncoderPool>,
}

impl PooledEncoder {
    /// Compress `data` and sync-flush, returning everything produced so far.
    fn chunk(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| io::Error::other("encoder already finished"))?;
        encoder.write_all(data)?;
        encoder.flush()?;
        let out = encoder.get_mut();
        let bytes = Bytes::copy_from_slice(out);
        out.clear();
        Ok(bytes)
    }

    /// Write the trailer and hand the buffer back to the pool.
    fn finish(&mut self) -> io::Result<Bytes> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| io::Error::other("encoder already finished"))?;
        match encoder.finish() {
            Ok(out) => {
                let bytes = Bytes::copy_from_slice(&out);
                self.pool.release(Some(out));
                Ok(bytes)
            }
            Err(e) => {
                self.pool.release(None);
                Err(e)
            }
        }
    }
}

impl Drop for PooledEncoder {
    fn drop(&mut self) {
        // Abandoned mid-stream: the buffer holds a partial member, drop it.
        if self.encoder.take().is_some() {
            self.pool.release(None);
        }
    }
}

/// Compression stage state, shared by every site of a generation.
#[derive(Debug, Clone)]
pub struct Compression {
    pool: Arc<EncoderPool>,
}

impl Compression {
    pub fn new(pool: Arc<EncoderPool>) -> Self {
        Self { pool }
    }
}

/// The primary content type: parameters stripped, lower-cased.
fn primary_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let primary = value.split(';').next()?.trim().to_ascii_lowercase();
    Some(primary)
}

pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("gzip"))
}

/// Whether a response head qualifies for compression.
pub fn should_compress(status: StatusCode, headers: &HeaderMap) -> bool {
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status == StatusCode::PARTIAL_CONTENT
    {
        return false;
    }
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    primary_type(headers)
        .map(|t| COMPRESSIBLE_TYPES.contains(&t.as_str()))
        .unwrap_or(false)
}

/// Ensure `Vary` names `Accept-Encoding` exactly once.
pub fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    let present = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("accept-encoding"));
    if !present {
        headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
}

pub async fn compression_middleware(
    State(compression): State<Compression>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let eligible = accepts_gzip(request.headers())
        && !request.headers().contains_key(header::SEC_WEBSOCKET_KEY)
        && request.method() != Method::HEAD;

    let response = next.run(request).await;
    if !eligible || !should_compress(response.status(), response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    add_vary_accept_encoding(&mut parts.headers);

    Response::from_parts(parts, gzip_body(body, compression.pool.acquire()))
}

struct GzipStream {
    body: BodyDataStream,
    encoder: PooledEncoder,
    done: bool,
}

fn gzip_body(body: Body, encoder: PooledEncoder) -> Body {
    let state = GzipStream {
        body: body.into_data_stream(),
        encoder,
        done: false,
    };

    let stream = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            let produced = match state.body.next().await {
                Some(Ok(data)) if data.is_empty() => continue,
                Some(Ok(data)) => state.encoder.chunk(&data).map_err(axum::Error::new),
                Some(Err(e)) => {
                    state.done = true;
                    Err(e)
                }
                None => {
                    state.done = true;
                    state.encoder.finish().map_err(axum::Error::new)
                }
            };
            if let Err(e) = &produced {
                tracing::warn!(error = %e, "Compressed response stream aborted");
                state.done = true;
            }
            return Some((produced, state));
        }
    });
    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use std::io::Read;
    use tower::ServiceExt;

    fn gunzip(bytes: &[u8]) -> String {
        let mut out = String::new();
        flate2::read::GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
        out
    }

    fn app(pool: Arc<EncoderPool>, content_type: &'static str) -> Router {
        Router::new()
            .route(
                "/",
                get(move || async move {
                    ([(header::CONTENT_TYPE, content_type)], "hello hello hello hello")
                }),
            )
            .layer(from_fn_with_state(Compression::new(pool), compression_middleware))
    }

    fn request(accept_encoding: &'static str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(header::ACCEPT_ENCODING, accept_encoding)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn compresses_text_round_trip() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let response = app(pool.clone(), "text/html; charset=utf-8")
            .oneshot(request("gzip, deflate"))
            .await
            .unwrap();

        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(gunzip(&bytes), "hello hello hello hello");
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn skips_binary_types() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let response = app(pool.clone(), "image/png").oneshot(request("gzip")).await.unwrap();
        assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn skips_without_gzip_accept() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let response = app(pool, "text/plain").oneshot(request("br")).await.unwrap();
        assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
    }

    #[tokio::test]
    async fn passes_through_encoded_responses() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let router = Router::new()
            .route(
                "/",
                get(|| async {
                    (
                        [
                            (header::CONTENT_TYPE, "text/css"),
                            (header::CONTENT_ENCODING, "br"),
                        ],
                        "raw-brotli-bytes",
                    )
                }),
            )
            .layer(from_fn_with_state(Compression::new(pool), compression_middleware));

        let response = router.oneshot(request("gzip, br")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"raw-brotli-bytes");
    }

    #[tokio::test]
    async fn encoder_returned_when_client_disconnects() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let response = app(pool.clone(), "application/json")
            .oneshot(request("gzip"))
            .await
            .unwrap();
        assert_eq!(pool.outstanding(), 1);
        drop(response);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn streams_multiple_chunks() {
        let pool = EncoderPool::new(flate2::Compression::fast());
        let chunks: Vec<Result<Bytes, io::Error>> = (0..50)
            .map(|i| Ok(Bytes::from(format!("line {i}\n"))))
            .collect();
        let body = gzip_body(Body::from_stream(stream::iter(chunks)), pool.acquire());
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let expected: String = (0..50).map(|i| format!("line {i}\n")).collect();
        assert_eq!(gunzip(&bytes), expected);
    }

    #[tokio::test]
    async fn empty_body_still_forms_a_gzip_member() {
        let pool = EncoderPool::new(flate2::Compression::default());
        let body = gzip_body(Body::empty(), pool.acquire());
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&bytes), "");
    }

    #[tokio::test]
    async fn output_buffers_are_reused() {
        let pool = EncoderPool::new(flate2::Compression::default());
        for _ in 0..3 {
            let body = gzip_body(Body::from("again and again and again"), pool.acquire());
            let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            assert_eq!(gunzip(&bytes), "again and again and again");
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn content_type_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("Application/JSON; charset=utf-8"));
        assert!(should_compress(StatusCode::OK, &headers));
        assert!(!should_compress(StatusCode::NOT_MODIFIED, &headers));
        assert!(!should_compress(StatusCode::PARTIAL_CONTENT, &headers));
        assert!(!should_compress(StatusCode::OK, &HeaderMap::new()));
    }
}
