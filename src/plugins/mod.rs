//! Plugin subsystem.
//!
//! # Data Flow
//! ```text
//! generation start:
//!     PluginManager::init_all        → on_init for every allowed plugin (fatal)
//!     PluginManager::init_for_site   → on_init_for_site for every allowed plugin,
//!                                      returns the site's active set
//! per request (pipeline.rs):
//!     before_request (all active) → handle_request (until one handles)
//!     → inner handler (unless handled) → after_request (all active)
//! generation stop:
//!     PluginManager::shutdown        → on_exit for every plugin (errors logged)
//! ```
//!
//! # Design Decisions
//! - A plugin is active for a site when the site has a config block under
//!   the plugin's name and, for plugins that require it, `"enable": true`
//! - Every hook runs inside a panic boundary; a panicking `handle_request`
//!   fails closed with a 500 page
//! - Per-site logging is a value handed to the plugin, not inherited state

pub mod auth;
pub mod manager;
pub mod pipeline;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, Response, Uri},
};
use thiserror::Error;

use crate::config::SiteConfig;

pub use auth::AuthPlugin;
pub use manager::PluginManager;
pub use pipeline::{plugin_middleware, PluginPipeline};

/// Outcome of [`Plugin::handle_request`].
pub enum PluginResult {
    /// Let later plugins and the site handler run.
    Continue,
    /// The plugin produced the response; the site handler is skipped.
    Handled(Response<Body>),
}

impl std::fmt::Debug for PluginResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginResult::Continue => f.write_str("Continue"),
            PluginResult::Handled(r) => write!(f, "Handled({})", r.status()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} is already registered")]
    Duplicate(String),

    #[error("plugin {plugin}: {message}")]
    Failed { plugin: String, message: String },

    #[error("plugin {plugin} panicked in {hook}: {message}")]
    Panicked {
        plugin: String,
        hook: &'static str,
        message: String,
    },
}

impl PluginError {
    pub fn failed(plugin: &str, message: impl Into<String>) -> Self {
        PluginError::Failed {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }
}

/// Request data still available to `after_request`, once the body is gone.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub domain: String,
}

impl RequestHead {
    pub fn capture(request: &Request<Body>, domain: &str) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            domain: domain.to_string(),
        }
    }
}

/// Structured logger scoped to one plugin on one site.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
    domain: Arc<str>,
}

impl PluginLogger {
    pub fn new(plugin: &str, domain: &str) -> Self {
        Self {
            plugin: Arc::from(plugin),
            domain: Arc::from(domain),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, domain = %self.domain, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin, domain = %self.domain, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin, domain = %self.domain, "{message}");
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin, domain = %self.domain, "{message}");
    }
}

/// An extension that participates in request handling.
///
/// Every hook has a no-op default so plugins implement only what they use.
/// Hooks take `&self`; plugins keep per-site state behind their own locks.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Unique name; also the key of the plugin's block in `plugin_configs`.
    fn name(&self) -> &str;

    /// Whether the site block must contain `"enable": true` to activate.
    fn requires_enable_flag(&self) -> bool {
        true
    }

    /// Called once per server generation, before any site is built.
    async fn on_init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called for every site, whether or not the site configures the plugin.
    async fn on_init_for_site(
        &self,
        _site: &SiteConfig,
        _logger: PluginLogger,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn before_request(&self, _request: &mut Request<Body>) {}

    async fn handle_request(&self, _request: &mut Request<Body>) -> PluginResult {
        PluginResult::Continue
    }

    fn after_request(&self, _request: &RequestHead, _response: &mut Response<Body>) {}

    async fn on_exit(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
