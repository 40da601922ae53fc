//! Request inspection helpers.
//!
//! # Responsibilities
//! - Extract the routing host (Host header or URI authority, port stripped)
//! - Resolve the client address (X-Real-IP, X-Forwarded-For, socket)
//! - Carry the resolved site domain through request extensions
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - IPv6 literals keep their brackets so `[::1]:80` strips to `[::1]`

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{header, Request},
};

/// Domain of the site handling the request, inserted by the plugin pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDomain(pub String);

/// Remove a trailing `:port` from a host value.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, which has no port.
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// The lower-cased routing host of a request, without port.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    let host = strip_port(raw.trim());
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Client address for logging and per-client state.
pub fn client_ip<B>(req: &Request<B>) -> String {
    let headers = req.headers();
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    peer_addr(req)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

/// Socket address of the peer, when the server recorded it.
pub fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}
