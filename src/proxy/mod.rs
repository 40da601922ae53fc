//! Reverse proxy subsystem.
//!
//! # Data Flow
//! ```text
//! site build:  SiteConfig → ProxyKey → ProxyPool::get_or_create → Arc<ReverseProxy>
//! per request: ReverseProxy::forward
//!     → rewrite URI, strip hop-by-hop, X-Forwarded-For
//!     → shared hyper client
//!     → 101? tunnel both upgraded streams
//!     → else stream body, coalesced per FlushPolicy into pooled buffers
//! ```

pub mod buffer;
pub mod pool;
pub mod reverse_proxy;

pub use buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
pub use pool::{ProxyKey, ProxyPool};
pub use reverse_proxy::{FlushPolicy, ProxyError, ReverseProxy};
