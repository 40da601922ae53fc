//! Server generation: everything one configuration snapshot runs.
//!
//! # Responsibilities
//! - Create the generation's shared state (access log, proxy pool, encoder
//!   pool, plugin manager, base middleware chain)
//! - Build one router per port group and bind it with axum-server
//! - Stop listeners gracefully, then plugins, then the access log
//!
//! # Data Flow
//! ```text
//! Vec<SiteConfig>
//!     → group_by_port
//!     → per group: build_port (dispatcher.rs) → ListenerSettings → axum-server
//!     → ServerGeneration { listeners, plugins, access_log }
//! ```
//!
//! # Design Decisions
//! - TLS is served only on single-site ports; a shared port cannot pick a
//!   certificate before it knows the host
//! - A port that fails to bind is logged and skipped; a generation with no
//!   bound port is an error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ServerSettings, SiteConfig};
use crate::http::dispatcher::{build_port, group_by_port, PortGroup};
use crate::http::handler::SiteBuilder;
use crate::http::middleware::{EncoderPool, MiddlewareChain};
use crate::net::{load_tls_config, ListenerSettings};
use crate::observability::access_log::{AsyncLogger, LoggerRegistry};
use crate::plugins::{Plugin, PluginError, PluginManager};
use crate::proxy::ProxyPool;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("plugin initialization failed: {0}")]
    Plugin(#[from] PluginError),

    #[error("no listener could be started")]
    NoListeners,
}

/// Middleware every site starts from: request ids and trace spans.
pub fn base_chain() -> MiddlewareChain {
    MiddlewareChain::new()
        .with(|router: Router| {
            router
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        })
        .with(|router: Router| router.layer(TraceLayer::new_for_http()))
}

#[derive(Debug)]
struct RunningPort {
    port: u16,
    addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

/// One running set of listeners built from one configuration snapshot.
#[derive(Debug)]
pub struct ServerGeneration {
    ports: Vec<RunningPort>,
    plugins: Arc<PluginManager>,
    access_log: Arc<AsyncLogger>,
    grace: Duration,
}

impl ServerGeneration {
    pub async fn start(
        sites: &[SiteConfig],
        plugins: Vec<Arc<dyn Plugin>>,
        settings: &ServerSettings,
    ) -> Result<Self, ServerError> {
        let access_log = AsyncLogger::new(settings.logging.access_log_capacity);

        let mut manager = PluginManager::new(settings.plugins.clone());
        manager.register_all(plugins);
        let manager = Arc::new(manager);
        if let Err(e) = manager.init_all().await {
            access_log.shutdown().await;
            return Err(e.into());
        }

        let builder = SiteBuilder {
            base_chain: base_chain(),
            plugins: manager.clone(),
            proxies: Arc::new(ProxyPool::new()),
            encoders: EncoderPool::new(flate2::Compression::default()),
            access_log: access_log.clone(),
            loggers: Arc::new(LoggerRegistry::new()),
        };

        let mut ports = Vec::new();
        for group in group_by_port(sites) {
            let Some(router) = build_port(&group, &builder).await else {
                continue;
            };
            match serve_port(&group, router).await {
                Some(running) => ports.push(running),
                None => continue,
            }
        }

        let generation = Self {
            ports,
            plugins: manager,
            access_log,
            grace: settings.shutdown.grace(),
        };
        if generation.ports.is_empty() {
            generation.shutdown().await;
            return Err(ServerError::NoListeners);
        }

        tracing::info!(
            ports = ?generation.ports.iter().map(|p| p.port).collect::<Vec<_>>(),
            plugins = ?generation.plugins.names(),
            "Server generation started"
        );
        Ok(generation)
    }

    /// Addresses of every bound listener.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.ports.iter().map(|p| p.addr).collect()
    }

    /// Bound address of the listener for a configured port.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ports.iter().find(|p| p.port == port).map(|p| p.addr)
    }

    pub fn access_log(&self) -> &Arc<AsyncLogger> {
        &self.access_log
    }

    /// Stop listeners (in-flight requests get the grace period), then plugins,
    /// then drain the access log.
    pub async fn shutdown(self) {
        for port in &self.ports {
            port.handle.graceful_shutdown(Some(self.grace));
        }
        for port in self.ports {
            match port.task.await {
                Ok(Ok(())) => tracing::debug!(port = port.port, "Listener stopped"),
                Ok(Err(e)) => tracing::error!(port = port.port, error = %e, "Listener failed"),
                Err(e) => tracing::error!(port = port.port, error = %e, "Listener task aborted"),
            }
        }
        self.plugins.shutdown().await;
        self.access_log.shutdown().await;
        tracing::info!("Server generation stopped");
    }
}

async fn serve_port(group: &PortGroup, router: Router) -> Option<RunningPort> {
    let settings = ListenerSettings::for_group(group);
    let app = router.into_make_service_with_connect_info::<SocketAddr>();
    let handle = Handle::new();

    let tls_site = match group.sites.as_slice() {
        [site] if site.ssl.enabled => Some(site),
        sites => {
            for site in sites.iter().filter(|s| s.ssl.enabled) {
                tracing::warn!(
                    domain = %site.domain,
                    port = group.port,
                    "TLS is not supported on shared ports, serving plain HTTP"
                );
            }
            None
        }
    };

    let task = match tls_site {
        Some(site) => {
            let tls = match load_tls_config(&site.ssl).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::error!(domain = %site.domain, error = %e, "Failed to load TLS config");
                    return None;
                }
            };
            let mut server = axum_server::bind_rustls(settings.addr, tls).handle(handle.clone());
            settings.apply(server.http_builder());
            tokio::spawn(async move { server.serve(app).await })
        }
        None => {
            let mut server = axum_server::bind(settings.addr).handle(handle.clone());
            settings.apply(server.http_builder());
            tokio::spawn(async move { server.serve(app).await })
        }
    };

    match handle.listening().await {
        Some(addr) => {
            tracing::info!(
                port = group.port,
                address = %addr,
                identifier = %group.identifier(),
                tls = tls_site.is_some(),
                "Listening"
            );
            Some(RunningPort {
                port: group.port,
                addr,
                handle,
                task,
            })
        }
        None => {
            let error = match task.await {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "listener exited".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::error!(port = group.port, error = %error, "Failed to bind port");
            None
        }
    }
}
