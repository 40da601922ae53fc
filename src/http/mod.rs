//! HTTP serving subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (axum-server, one listener per port)
//!     → dispatcher.rs (host → site router, first-site fallback)
//!     → handler.rs (site chain: base → plugins → admission → timeout
//!                   → compression → access log, around the inner handler)
//!     → static_files.rs | proxy::ReverseProxy
//!     → pages.rs (error, welcome and listing pages)
//! ```

pub mod dispatcher;
pub mod handler;
pub mod middleware;
pub mod pages;
pub mod request;
pub mod server;
pub mod static_files;

pub use dispatcher::{group_by_port, PortDispatcher, PortGroup};
pub use handler::{SiteBuildError, SiteBuilder};
pub use request::SiteDomain;
pub use server::{base_chain, ServerError, ServerGeneration};
pub use static_files::StaticResponder;
