//! Single-upstream reverse proxy.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the upstream target
//! - Strip hop-by-hop headers in both directions, append `X-Forwarded-For`
//! - Stream the upstream body back, coalescing chunks per the flush policy
//! - Tunnel protocol upgrades (WebSocket) once the upstream agrees
//! - Turn transport failures into a generic 502 page
//!
//! # Design Decisions
//! - One hyper client per generation, shared by every proxy
//! - The incoming `Host` header is forwarded unchanged
//! - Upstream error details are logged, never sent to the client

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, BodyDataStream},
    http::{
        header, uri::PathAndQuery, HeaderMap, HeaderName, HeaderValue, Request, Response,
        StatusCode, Uri,
    },
};
use bytes::Bytes;
use futures_util::{stream, FutureExt, StreamExt};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use thiserror::Error;

use crate::http::pages;
use crate::http::request::peer_addr;
use crate::observability::metrics;
use crate::proxy::buffer::{BufferPool, PooledBuffer};

/// Client type shared by all proxies of a generation.
pub type HttpClient = Client<HttpConnector, Body>;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build the shared upstream client.
pub fn build_client() -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(30)));
    connector.set_keepalive(Some(Duration::from_secs(30)));
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector)
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream URL {0:?}")]
    InvalidTarget(String),
}

/// When proxied response bytes are pushed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Coalesce whatever is already available, then send.
    Default,
    /// Coalesce for at most this long, then send.
    Interval(Duration),
    /// Send every chunk as soon as it arrives.
    Immediate,
}

impl FlushPolicy {
    /// Parse a flush interval such as `"100ms"`, `"1s"` or `"-1"`.
    ///
    /// Negative values flush every chunk; empty, zero or unparsable values
    /// keep the default.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == "0" {
            return FlushPolicy::Default;
        }
        if value.starts_with('-') {
            return FlushPolicy::Immediate;
        }
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => FlushPolicy::Default,
            Ok(d) => FlushPolicy::Interval(d),
            Err(e) => {
                tracing::warn!(value, error = %e, "Ignoring invalid proxy_flush_interval");
                FlushPolicy::Default
            }
        }
    }
}

/// Parsed upstream target.
#[derive(Debug, Clone)]
struct Target {
    scheme: axum::http::uri::Scheme,
    authority: axum::http::uri::Authority,
    path: String,
    query: Option<String>,
}

impl Target {
    fn parse(raw: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidTarget(raw.to_string());
        let url = url::Url::parse(raw.trim()).map_err(|_| invalid())?;
        if url.scheme() != "http" {
            return Err(invalid());
        }
        let uri: Uri = url.as_str().parse().map_err(|_| invalid())?;
        let parts = uri.into_parts();
        Ok(Self {
            scheme: parts.scheme.ok_or_else(invalid)?,
            authority: parts.authority.ok_or_else(invalid)?,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
        })
    }

    /// The upstream URI for an incoming request URI.
    fn rewrite(&self, incoming: &Uri) -> Result<Uri, axum::http::Error> {
        let path = join_paths(&self.path, incoming.path());
        let query = match (self.query.as_deref(), incoming.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }
}

/// Join two URL paths with exactly one slash between them.
pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: &str) {
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    {
        Some(prior) => format!("{prior}, {client}"),
        None => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// A reverse proxy bound to one upstream and one transport configuration.
#[derive(Debug)]
pub struct ReverseProxy {
    target: Target,
    target_raw: String,
    client: HttpClient,
    flush: FlushPolicy,
    buffers: Arc<BufferPool>,
}

impl ReverseProxy {
    pub fn new(
        target: &str,
        client: HttpClient,
        flush: FlushPolicy,
        buffers: Arc<BufferPool>,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            target: Target::parse(target)?,
            target_raw: target.trim().to_string(),
            client,
            flush,
            buffers,
        })
    }

    pub fn target(&self) -> &str {
        &self.target_raw
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush
    }

    pub fn buffer_size(&self) -> usize {
        self.buffers.size()
    }

    /// Forward a request for `domain` upstream and return the client response.
    pub async fn forward(&self, domain: &str, mut request: Request<Body>) -> Response<Body> {
        let mut negotiation = HeaderMap::new();
        if let Some(accept) = request.headers().get(header::ACCEPT) {
            negotiation.insert(header::ACCEPT, accept.clone());
        }

        let upgrade = is_upgrade_request(request.headers());
        let upgrade_protocol = request.headers().get(header::UPGRADE).cloned();
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let uri = match self.target.rewrite(request.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "Cannot map request onto upstream");
                return pages::error_response(&negotiation, StatusCode::BAD_REQUEST);
            }
        };
        *request.uri_mut() = uri;
        *request.version_mut() = axum::http::Version::HTTP_11;

        let peer = peer_addr(&request);
        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        if let Some(protocol) = upgrade_protocol.filter(|_| upgrade) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
        if let Some(peer) = peer {
            append_forwarded_for(headers, &peer.ip().to_string());
        }

        let mut response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    domain = %domain,
                    upstream = %self.target_raw,
                    error = %e,
                    "Proxy error"
                );
                metrics::record_proxy_error(domain);
                return pages::error_response(&negotiation, StatusCode::BAD_GATEWAY);
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(client_upgrade, upstream_upgrade, domain.to_string()));
            }
            let (parts, _) = response.into_parts();
            return Response::from_parts(parts, Body::empty());
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let flush = if is_event_stream(&parts.headers) {
            FlushPolicy::Immediate
        } else {
            self.flush
        };
        let body = Body::new(body);
        let body = match flush {
            FlushPolicy::Immediate => body,
            policy => coalesce(body.into_data_stream(), self.buffers.acquire(), policy),
        };
        Response::from_parts(parts, body)
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

async fn tunnel(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade, domain: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(domain = %domain, error = %e, "Upgrade handshake failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(domain = %domain, sent, received, "Upgraded connection closed");
        }
        Err(e) => {
            tracing::debug!(domain = %domain, error = %e, "Upgraded connection closed with error");
        }
    }
}

struct Coalesce {
    body: BodyDataStream,
    buf: PooledBuffer,
    policy: FlushPolicy,
    pending_error: Option<axum::Error>,
    done: bool,
}

impl Coalesce {
    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Absorb one polled item. Returns false when no more data should be read.
    fn absorb(&mut self, item: Option<Result<Bytes, axum::Error>>) -> bool {
        match item {
            Some(Ok(data)) => {
                self.buf.extend_from_slice(&data);
                self.buf.len() < self.buf.limit()
            }
            Some(Err(e)) => {
                self.pending_error = Some(e);
                false
            }
            None => {
                self.done = true;
                false
            }
        }
    }
}

/// Re-chunk a body so writes are grouped per the flush policy.
fn coalesce(body: BodyDataStream, buf: PooledBuffer, policy: FlushPolicy) -> Body {
    let state = Coalesce {
        body,
        buf,
        policy,
        pending_error: None,
        done: false,
    };

    let stream = stream::unfold(state, |mut state| async move {
        if let Some(e) = state.pending_error.take() {
            state.done = true;
            return Some((Err(e), state));
        }
        if state.done {
            return None;
        }

        // Wait for the first chunk of this write.
        match state.body.next().await {
            Some(Ok(data)) if state.buf.is_empty() && data.len() >= state.buf.limit() => {
                return Some((Ok(data), state));
            }
            first => {
                if !state.absorb(first) {
                    return flush_or_finish(state);
                }
            }
        }

        match state.policy {
            FlushPolicy::Interval(window) => {
                let deadline = tokio::time::Instant::now() + window;
                loop {
                    match tokio::time::timeout_at(deadline, state.body.next()).await {
                        Ok(item) => {
                            if !state.absorb(item) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
            _ => {
                while let Some(item) = state.body.next().now_or_never() {
                    if !state.absorb(item) {
                        break;
                    }
                }
            }
        }
        flush_or_finish(state)
    });
    Body::from_stream(stream)
}

fn flush_or_finish(mut state: Coalesce) -> Option<(Result<Bytes, axum::Error>, Coalesce)> {
    if !state.buf.is_empty() {
        let chunk = state.take();
        return Some((Ok(chunk), state));
    }
    if let Some(e) = state.pending_error.take() {
        state.done = true;
        return Some((Err(e), state));
    }
    None
}
