//! Port grouping and host-based dispatch.
//!
//! # Responsibilities
//! - Group site configs by listening port, keeping configuration order
//! - Build one router per port: the site handler itself when the port has
//!   one site, a virtual-host dispatcher when it has several
//!
//! # Design Decisions
//! - Host lookup is exact on the lower-cased host with the port stripped
//! - Unknown hosts fall back to the first site built on the port, or a 404
//!   page when no site on the port could be built
//! - A failed site on a shared port is skipped; its siblings still serve

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use tower::ServiceExt;

use crate::config::SiteConfig;
use crate::http::handler::SiteBuilder;
use crate::http::pages;
use crate::http::request::request_host;

/// The sites configured on one port, in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct PortGroup {
    pub port: u16,
    pub sites: Vec<SiteConfig>,
}

impl PortGroup {
    pub fn is_shared(&self) -> bool {
        self.sites.len() > 1
    }

    /// Access-log identifier: the domain alone, or `port_<n>` when shared.
    pub fn identifier(&self) -> String {
        match self.sites.as_slice() {
            [only] => only.domain.clone(),
            _ => format!("port_{}", self.port),
        }
    }
}

/// Group sites by port in one pass. Groups appear in first-seen port order.
pub fn group_by_port(sites: &[SiteConfig]) -> Vec<PortGroup> {
    let mut index: HashMap<u16, usize> = HashMap::new();
    let mut groups: Vec<PortGroup> = Vec::new();
    for site in sites {
        let slot = *index.entry(site.port).or_insert_with(|| {
            groups.push(PortGroup {
                port: site.port,
                sites: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].sites.push(site.clone());
    }
    groups
}

/// Virtual-host dispatcher for a shared port.
#[derive(Clone, Default)]
pub struct PortDispatcher {
    hosts: HashMap<String, Router>,
    first: Option<Router>,
}

impl std::fmt::Debug for PortDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hosts: Vec<_> = self.hosts.keys().collect();
        hosts.sort();
        f.debug_struct("PortDispatcher").field("hosts", &hosts).finish()
    }
}

impl PortDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a site. The first one added is the fallback for unknown hosts.
    pub fn insert(&mut self, domain: &str, router: Router) {
        if self.first.is_none() {
            self.first = Some(router.clone());
        }
        self.hosts.insert(domain.to_ascii_lowercase(), router);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The router for `host`, the first site's for unknown hosts.
    pub fn resolve(&self, host: Option<&str>) -> Option<&Router> {
        host.and_then(|h| self.hosts.get(h))
            .or_else(|| {
                tracing::debug!(host = ?host, "Unknown host, using first site");
                self.first.as_ref()
            })
    }

    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let host = request_host(&request);
        let Some(router) = self.resolve(host.as_deref()) else {
            return pages::error_response(request.headers(), StatusCode::NOT_FOUND);
        };
        router
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {})
    }

    pub fn into_router(self) -> Router {
        let dispatcher = Arc::new(self);
        Router::new().fallback(move |request: Request<Body>| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request).await }
        })
    }
}

/// Build the router serving `group`, or `None` when the port should not be
/// bound (its single site failed to build).
pub async fn build_port(group: &PortGroup, builder: &SiteBuilder) -> Option<Router> {
    let identifier = group.identifier();

    if let [site] = group.sites.as_slice() {
        return match builder.build(site, &identifier).await {
            Ok(router) => Some(router),
            Err(e) => {
                tracing::error!(port = group.port, error = %e, "Site failed to start");
                None
            }
        };
    }

    let mut dispatcher = PortDispatcher::new();
    for site in &group.sites {
        match builder.build(site, &identifier).await {
            Ok(router) => dispatcher.insert(&site.domain, router),
            Err(e) => tracing::error!(port = group.port, error = %e, "Site failed to start, skipping"),
        }
    }
    tracing::info!(
        port = group.port,
        identifier = %identifier,
        sites = dispatcher.len(),
        "Virtual host dispatcher ready"
    );
    Some(dispatcher.into_router())
}
