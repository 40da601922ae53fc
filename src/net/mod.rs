//! Listener-level concerns shared by every port.
//!
//! # Data Flow
//! ```text
//! PortGroup
//!     → listener.rs (bind address, per-port HTTP settings)
//!     → tls.rs (rustls config for single-site TLS ports)
//!     → http::server spawns the axum-server listener
//! ```

pub mod listener;
pub mod tls;

pub use listener::ListenerSettings;
pub use tls::load_tls_config;
