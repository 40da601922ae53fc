//! Generation supervisor.
//!
//! Runs one [`ServerGeneration`] at a time. A restart request (from a
//! [`RestartHandle`] or SIGHUP) reloads the site configuration, stops the
//! current generation and starts a fresh one with new plugin instances. If
//! the new configuration does not load, the current generation keeps
//! serving; if it loads but cannot start, the previous configuration is
//! started again.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;

use crate::config::{load_sites, ConfigError, ServerSettings, SiteConfig, SiteSource};
use crate::http::server::{ServerError, ServerGeneration};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{SignalEvent, Signals};
use crate::plugins::Plugin;

/// Produces the plugin instances for each new generation.
pub type PluginFactory = Arc<dyn Fn() -> Vec<Arc<dyn Plugin>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Requests an in-process restart of the running server.
#[derive(Debug, Clone, Default)]
pub struct RestartHandle {
    notify: Arc<Notify>,
}

impl RestartHandle {
    pub fn restart(&self) {
        self.notify.notify_one();
    }

    async fn requested(&self) {
        self.notify.notified().await
    }
}

enum Control {
    Restart,
    Shutdown,
}

pub struct Supervisor {
    source: SiteSource,
    settings: ServerSettings,
    plugins: PluginFactory,
    restart: RestartHandle,
    shutdown: Shutdown,
    watch_signals: bool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("source", &self.source)
            .field("watch_signals", &self.watch_signals)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(source: SiteSource, settings: ServerSettings) -> Self {
        Self {
            source,
            settings,
            plugins: Arc::new(Vec::<Arc<dyn Plugin>>::new),
            restart: RestartHandle::default(),
            shutdown: Shutdown::new(),
            watch_signals: true,
        }
    }

    pub fn with_plugins<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.plugins = Arc::new(factory);
        self
    }

    /// Do not react to OS signals; control only through the handles.
    pub fn without_signals(mut self) -> Self {
        self.watch_signals = false;
        self
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    async fn start(&self, sites: &[SiteConfig]) -> Result<ServerGeneration, ServerError> {
        ServerGeneration::start(sites, (self.plugins)(), &self.settings).await
    }

    /// Replace the running generation with one built from `sites`.
    ///
    /// When the new generation cannot start, the previous configuration is
    /// started again. If that fails too, nothing serves until the next
    /// restart request.
    async fn replace(
        &self,
        generation: &mut Option<ServerGeneration>,
        running: &mut Vec<SiteConfig>,
        sites: Vec<SiteConfig>,
    ) -> bool {
        if let Some(old) = generation.take() {
            old.shutdown().await;
        }

        let error = match self.start(&sites).await {
            Ok(next) => {
                *generation = Some(next);
                *running = sites;
                return true;
            }
            Err(e) => e,
        };
        tracing::error!(error = %error, "New configuration failed to start, restoring previous one");

        match self.start(running).await {
            Ok(previous) => *generation = Some(previous),
            Err(e) => {
                tracing::error!(error = %e, "Previous configuration failed to start, waiting for next restart");
            }
        }
        false
    }

    /// Serve until shutdown is requested.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut signals = if self.watch_signals {
            Some(Signals::register().map_err(SupervisorError::Signals)?)
        } else {
            None
        };

        let mut running = load_sites(&self.source)?;
        let mut generation = Some(self.start(&running).await?);
        let mut count = 1u64;

        loop {
            let control = tokio::select! {
                _ = shutdown_rx.recv() => Control::Shutdown,
                _ = self.restart.requested() => Control::Restart,
                event = next_signal(&mut signals) => match event {
                    SignalEvent::Shutdown => Control::Shutdown,
                    SignalEvent::Reload => Control::Restart,
                },
            };

            match control {
                Control::Shutdown => {
                    tracing::info!("Shutdown requested");
                    if let Some(generation) = generation.take() {
                        generation.shutdown().await;
                    }
                    return Ok(());
                }
                Control::Restart => {
                    let sites = match load_sites(&self.source) {
                        Ok(sites) => sites,
                        Err(e) => {
                            tracing::error!(error = %e, "Reload failed, keeping current configuration");
                            continue;
                        }
                    };
                    tracing::info!(generation = count, "Restarting server");
                    if self.replace(&mut generation, &mut running, sites).await {
                        count += 1;
                        tracing::info!(generation = count, "Restart complete");
                    }
                }
            }
        }
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> SignalEvent {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}
