//! Configuration schema definitions.
//!
//! Two kinds of configuration exist:
//! - [`SiteConfig`]: one per hosted site, read from JSON files.
//! - [`ServerSettings`]: process-wide knobs, read from an optional TOML file.
//!
//! All types derive Serde traits; every field has a default so minimal
//! configs are accepted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request timeout applied when a site leaves `request_timeout` at 0.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a single hosted site.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SiteConfig {
    /// Host name this site answers to (exact match, port stripped).
    pub domain: String,

    /// Listening port. Sites sharing a port become virtual hosts.
    pub port: u16,

    /// Document root for static serving. Empty means none.
    pub root_directory: String,

    /// Headers added to every response of this site.
    pub custom_headers: HashMap<String, String>,

    /// Upstream URL. When set, the site is a reverse proxy.
    pub proxy_pass: String,

    pub ssl: SslConfig,

    /// Seconds. 0 selects the 60s default, negative disables the timeout.
    pub request_timeout: i64,

    /// Seconds allowed for reading request headers. 0 = unset.
    pub read_header_timeout: i64,

    /// Seconds a keep-alive connection may stay idle. 0 = unset.
    pub idle_timeout: i64,

    /// Upper bound on request header size in bytes. 0 = server default.
    pub max_header_bytes: usize,

    /// Duration string ("100ms", "1s"); "-1" flushes every chunk.
    #[serde(rename = "proxy_flush_interval")]
    pub flush_interval: String,

    /// Proxy copy buffer size in KiB. 0 = shared default pool.
    pub buffer_size_kb: i64,

    /// Simultaneous in-flight requests allowed. 0 = unlimited.
    pub max_concurrent_connections: usize,

    /// Unset means enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_logging: Option<bool>,

    /// Plain file server: directory listings instead of the landing page.
    pub file_server_mode: bool,

    /// Per-plugin configuration blocks keyed by plugin name.
    pub plugin_configs: HashMap<String, serde_json::Value>,
}

impl SiteConfig {
    /// Create a site with only domain and port set.
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
            ..Default::default()
        }
    }

    pub fn is_proxy(&self) -> bool {
        !self.proxy_pass.trim().is_empty()
    }

    pub fn logging_enabled(&self) -> bool {
        self.enable_logging.unwrap_or(true)
    }

    /// Effective request timeout, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout {
            0 => Some(DEFAULT_REQUEST_TIMEOUT),
            t if t < 0 => None,
            t => Some(Duration::from_secs(t as u64)),
        }
    }

    /// Header read deadline for the listener. Falls back to `idle_timeout`.
    pub fn header_read_timeout(&self) -> Option<Duration> {
        [self.read_header_timeout, self.idle_timeout]
            .into_iter()
            .find(|t| *t > 0)
            .map(|t| Duration::from_secs(t as u64))
    }

    /// The raw configuration block for a plugin, if the site has one.
    pub fn plugin_config(&self, name: &str) -> Option<&serde_json::Value> {
        self.plugin_configs.get(name)
    }
}

/// TLS settings for a site.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    /// Path to certificate file (PEM).
    pub certificate: String,
    /// Path to private key file (PEM).
    pub key: String,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerSettings {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub plugins: PluginsConfig,
    pub shutdown: ShutdownConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,

    /// Bounded capacity of the access-log queue.
    pub access_log_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "sitegate=info,access_log=info".to_string(),
            access_log_capacity: 10_000,
        }
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Plugin allow-list.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PluginsConfig {
    /// Names of plugins allowed to run. Empty allows every registered plugin.
    pub enabled: Vec<String>,
}

impl PluginsConfig {
    pub fn allows(&self, name: &str) -> bool {
        self.enabled.is_empty() || self.enabled.iter().any(|n| n == name)
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds in-flight requests get to finish when a generation stops.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Where site configurations come from.
#[derive(Debug, Clone)]
pub enum SiteSource {
    /// A single JSON file holding one site object or an array of them.
    File(PathBuf),
    /// Every `*.json` file in a directory.
    Directory(PathBuf),
    /// Sites supplied in memory (embedding, tests).
    Inline(Vec<SiteConfig>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_defaults_from_minimal_json() {
        let site: SiteConfig =
            serde_json::from_str(r#"{"domain":"a.test","port":8080}"#).unwrap();
        assert_eq!(site.domain, "a.test");
        assert!(site.logging_enabled());
        assert!(!site.is_proxy());
        assert_eq!(site.request_timeout(), Some(DEFAULT_REQUEST_TIMEOUT));
        assert!(site.plugin_configs.is_empty());
    }

    #[test]
    fn request_timeout_semantics() {
        let mut site = SiteConfig::new("a.test", 80);
        site.request_timeout = -1;
        assert_eq!(site.request_timeout(), None);
        site.request_timeout = 5;
        assert_eq!(site.request_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn header_timeout_falls_back_to_idle() {
        let mut site = SiteConfig::new("a.test", 80);
        assert_eq!(site.header_read_timeout(), None);
        site.idle_timeout = 30;
        assert_eq!(site.header_read_timeout(), Some(Duration::from_secs(30)));
        site.read_header_timeout = 5;
        assert_eq!(site.header_read_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn explicit_logging_flag() {
        let site: SiteConfig = serde_json::from_str(
            r#"{"domain":"a.test","port":1,"enable_logging":false,"proxy_flush_interval":"-1"}"#,
        )
        .unwrap();
        assert!(!site.logging_enabled());
        assert_eq!(site.flush_interval, "-1");
    }

    #[test]
    fn settings_from_toml() {
        let settings: ServerSettings = toml::from_str(
            r#"
            [plugins]
            enabled = ["AuthPlugin"]

            [shutdown]
            grace_secs = 3
            "#,
        )
        .unwrap();
        assert!(settings.plugins.allows("AuthPlugin"));
        assert!(!settings.plugins.allows("Other"));
        assert_eq!(settings.shutdown.grace(), Duration::from_secs(3));
        assert_eq!(settings.logging.access_log_capacity, 10_000);
        assert!(PluginsConfig::default().allows("Anything"));
    }
}
