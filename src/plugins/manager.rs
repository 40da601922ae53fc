//! Plugin registry and lifecycle.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::config::schema::PluginsConfig;
use crate::config::SiteConfig;
use crate::observability::metrics;
use crate::plugins::{panic_message, Plugin, PluginError, PluginLogger};

/// The plugins registered for one server generation.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    allowed: PluginsConfig,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.names())
            .field("allowed", &self.allowed)
            .finish()
    }
}

impl PluginManager {
    pub fn new(allowed: PluginsConfig) -> Self {
        Self {
            plugins: Vec::new(),
            allowed,
        }
    }

    /// Register a plugin. Names are unique; a second registration is rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if self.plugins.iter().any(|p| p.name() == name) {
            return Err(PluginError::Duplicate(name));
        }
        if !self.allowed.allows(&name) {
            tracing::info!(plugin = %name, "Plugin not in allow-list, skipping");
            return Ok(());
        }
        tracing::debug!(plugin = %name, "Registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Register every plugin in `plugins`, logging rejected duplicates.
    pub fn register_all(&mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) {
        for plugin in plugins {
            if let Err(e) = self.register(plugin) {
                tracing::warn!(error = %e, "Plugin registration rejected");
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin's `on_init`. The first failure aborts the generation.
    pub async fn init_all(&self) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            match AssertUnwindSafe(plugin.on_init()).catch_unwind().await {
                Ok(result) => result?,
                Err(payload) => {
                    metrics::record_plugin_panic(plugin.name(), "on_init");
                    return Err(PluginError::Panicked {
                        plugin: plugin.name().to_string(),
                        hook: "on_init",
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
            tracing::info!(plugin = %plugin.name(), "Plugin initialized");
        }
        Ok(())
    }

    /// Initialize every plugin for `site` and return the site's active set.
    ///
    /// A failure here aborts this site only.
    pub async fn init_for_site(
        &self,
        site: &SiteConfig,
    ) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        let mut active = Vec::new();
        for plugin in &self.plugins {
            let name = plugin.name();
            let logger = PluginLogger::new(name, &site.domain);
            match AssertUnwindSafe(plugin.on_init_for_site(site, logger))
                .catch_unwind()
                .await
            {
                Ok(result) => result?,
                Err(payload) => {
                    metrics::record_plugin_panic(name, "on_init_for_site");
                    return Err(PluginError::Panicked {
                        plugin: name.to_string(),
                        hook: "on_init_for_site",
                        message: panic_message(payload.as_ref()),
                    });
                }
            }

            if is_active(plugin.as_ref(), site) {
                tracing::info!(plugin = %name, domain = %site.domain, "Plugin active for site");
                active.push(plugin.clone());
            }
        }
        Ok(active)
    }

    /// Run every plugin's `on_exit`; failures are logged and skipped.
    pub async fn shutdown(&self) {
        for plugin in &self.plugins {
            match AssertUnwindSafe(plugin.on_exit()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(plugin = %plugin.name(), error = %e, "Plugin exit failed"),
                Err(payload) => {
                    metrics::record_plugin_panic(plugin.name(), "on_exit");
                    tracing::error!(
                        plugin = %plugin.name(),
                        panic = %panic_message(payload.as_ref()),
                        "Plugin panicked on exit"
                    );
                }
            }
        }
    }
}

fn is_active(plugin: &dyn Plugin, site: &SiteConfig) -> bool {
    let Some(block) = site.plugin_config(plugin.name()) else {
        return false;
    };
    !plugin.requires_enable_flag()
        || block.get("enable").and_then(|v| v.as_bool()).unwrap_or(false)
}
