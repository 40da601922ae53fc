//! Multi-site HTTP server core.
//!
//! Serves static sites and reverse-proxies to backends, many sites per port
//! as virtual hosts, with a per-site middleware chain and a plugin pipeline
//! around every request.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod plugins;
pub mod proxy;

pub use config::{ServerSettings, SiteConfig, SiteSource};
pub use http::{ServerError, ServerGeneration};
pub use lifecycle::{RestartHandle, Shutdown, Supervisor};
pub use plugins::{Plugin, PluginResult};
