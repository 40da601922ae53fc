//! Site handler construction.
//!
//! # Data Flow
//! ```text
//! SiteConfig
//!     → inner handler: ReverseProxy (proxy_pass) | StaticResponder (root) | welcome page
//!     → + custom headers (applied after the inner response, configured values win)
//!     → copy of the generation's base chain
//!         + plugin pipeline, admission, timeout, compression, access log
//!     → Router
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{any, MethodRouter},
    Router,
};
use thiserror::Error;

use crate::config::SiteConfig;
use crate::http::middleware::{
    access_log_middleware, admission_middleware, compression_middleware, timeout_middleware,
    AccessLog, AdmissionControl, Compression, EncoderPool, MiddlewareChain, RequestTimeout,
};
use crate::http::pages;
use crate::http::static_files::StaticResponder;
use crate::observability::access_log::{AsyncLogger, LoggerRegistry};
use crate::plugins::{plugin_middleware, PluginError, PluginManager, PluginPipeline};
use crate::proxy::{ProxyError, ProxyPool};

#[derive(Debug, Error)]
pub enum SiteBuildError {
    #[error("site {domain}: root directory {path} does not exist")]
    MissingRoot { domain: String, path: PathBuf },

    #[error("site {domain}: invalid proxy target: {source}")]
    Proxy {
        domain: String,
        #[source]
        source: ProxyError,
    },

    #[error("site {domain}: plugin initialization failed: {source}")]
    Plugin {
        domain: String,
        #[source]
        source: PluginError,
    },
}

/// Generation-wide resources every site handler draws on.
#[derive(Debug, Clone)]
pub struct SiteBuilder {
    pub base_chain: MiddlewareChain,
    pub plugins: Arc<PluginManager>,
    pub proxies: Arc<ProxyPool>,
    pub encoders: Arc<EncoderPool>,
    pub access_log: Arc<AsyncLogger>,
    pub loggers: Arc<LoggerRegistry>,
}

impl SiteBuilder {
    /// Build the complete handler for `site`.
    ///
    /// `identifier` names the access-log sink: the domain on a single-site
    /// port, `port_<n>` on a shared one.
    pub async fn build(&self, site: &SiteConfig, identifier: &str) -> Result<Router, SiteBuildError> {
        // Plugins first: a site they reject must not leave a pool entry behind.
        let active = self
            .plugins
            .init_for_site(site)
            .await
            .map_err(|source| SiteBuildError::Plugin {
                domain: site.domain.clone(),
                source,
            })?;

        let inner = self.inner_handler(site).await?;
        let inner = with_custom_headers(inner, &site.custom_headers);

        let mut chain = self.base_chain.clone();
        if !active.is_empty() {
            let pipeline = PluginPipeline::new(&site.domain, active);
            chain.push(move |router: Router| {
                router.layer(from_fn_with_state(pipeline.clone(), plugin_middleware))
            });
        }

        if site.max_concurrent_connections > 0 {
            let admission = AdmissionControl::new(&site.domain, site.max_concurrent_connections);
            chain.push(move |router: Router| {
                router.layer(from_fn_with_state(admission.clone(), admission_middleware))
            });
        }

        if let Some(duration) = site.request_timeout() {
            let timeout = RequestTimeout::new(&site.domain, duration);
            chain.push(move |router: Router| {
                router.layer(from_fn_with_state(timeout.clone(), timeout_middleware))
            });
        }

        let compression = Compression::new(self.encoders.clone());
        chain.push(move |router: Router| {
            router.layer(from_fn_with_state(compression.clone(), compression_middleware))
        });

        if site.logging_enabled() {
            let log = AccessLog::new(
                self.access_log.clone(),
                self.loggers.get_or_create(identifier),
                &site.domain,
            );
            chain.push(move |router: Router| {
                router.layer(from_fn_with_state(log.clone(), access_log_middleware))
            });
        }

        tracing::debug!(
            domain = %site.domain,
            identifier,
            stages = chain.len(),
            "Built site handler"
        );
        Ok(chain.apply(inner))
    }

    async fn inner_handler(&self, site: &SiteConfig) -> Result<Router, SiteBuildError> {
        if site.is_proxy() {
            let proxy = self
                .proxies
                .get_or_create(site)
                .map_err(|source| SiteBuildError::Proxy {
                    domain: site.domain.clone(),
                    source,
                })?;
            let domain: Arc<str> = Arc::from(site.domain.as_str());
            return Ok(catch_all(any(move |request: Request<Body>| {
                let proxy = proxy.clone();
                let domain = domain.clone();
                async move { proxy.forward(&domain, request).await }
            })));
        }

        let root = site.root_directory.trim();
        if root.is_empty() {
            return Ok(catch_all(any(|request: Request<Body>| async move {
                welcome_only(request)
            })));
        }

        let path = PathBuf::from(root);
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_dir() => {}
            _ => {
                return Err(SiteBuildError::MissingRoot {
                    domain: site.domain.clone(),
                    path,
                })
            }
        }
        let responder = StaticResponder::new(path, site.file_server_mode);
        Ok(catch_all(any(move |request: Request<Body>| {
            let responder = responder.clone();
            async move { responder.respond(request).await }
        })))
    }
}

/// Route every path to `route`.
fn catch_all(route: MethodRouter) -> Router {
    Router::new()
        .route("/", route.clone())
        .route("/{*path}", route)
}

/// Sites with neither a root nor an upstream: the landing page at `/`.
fn welcome_only(request: Request<Body>) -> Response {
    let method = request.method();
    if method != Method::GET && method != Method::HEAD {
        return pages::error_response(request.headers(), StatusCode::METHOD_NOT_ALLOWED);
    }
    if request.uri().path() == "/" {
        return pages::welcome_page();
    }
    pages::error_response(request.headers(), StatusCode::NOT_FOUND)
}

/// Configured response headers plus the matching expose list.
#[derive(Debug, Clone)]
struct CustomHeaders {
    headers: Arc<HeaderMap>,
}

impl CustomHeaders {
    fn from_config(configured: &std::collections::HashMap<String, String>) -> Self {
        let mut names: Vec<&String> = configured.keys().collect();
        names.sort();

        let mut headers = HeaderMap::new();
        let mut exposed = Vec::new();
        for name in names {
            let value = &configured[name];
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(header), Ok(value)) => {
                    headers.insert(header, value);
                    exposed.push(name.as_str());
                }
                _ => tracing::warn!(header = %name, "Skipping invalid custom header"),
            }
        }
        if !exposed.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&exposed.join(", ")) {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
            }
        }
        Self {
            headers: Arc::new(headers),
        }
    }
}

async fn custom_headers_middleware(
    State(custom): State<CustomHeaders>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    for (name, value) in custom.headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

fn with_custom_headers(
    router: Router,
    configured: &std::collections::HashMap<String, String>,
) -> Router {
    if configured.is_empty() {
        return router;
    }
    router.layer(from_fn_with_state(
        CustomHeaders::from_config(configured),
        custom_headers_middleware,
    ))
}
