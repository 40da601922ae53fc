//! Per-site middleware composition.
//!
//! # Data Flow
//! ```text
//! base chain (per generation): request id, trace spans
//!     → copy per site
//!     → + plugin pipeline
//!     → + admission control   (max_concurrent_connections > 0)
//!     → + request timeout     (unless disabled)
//!     → + compression
//!     → + access log          (enable_logging unset or true)
//!     → apply(handler)
//! ```
//!
//! # Design Decisions
//! - A wrapper is any `Router -> Router` function, so tower layers and
//!   `axum::middleware::from_fn_with_state` functions both fit
//! - `apply` folds in registration order: the last registered wrapper is
//!   outermost and sees the request first
//! - Cloning a chain copies its wrapper list; extending the copy never
//!   touches the source

pub mod compression;
pub mod concurrency;
pub mod logging;
pub mod timeout;

use std::fmt;
use std::sync::Arc;

use axum::{body::Body, Router};
use futures_util::StreamExt;

pub use compression::{compression_middleware, Compression, EncoderPool};
pub use concurrency::{admission_middleware, AdmissionControl};
pub use logging::{access_log_middleware, AccessLog};
pub use timeout::{timeout_middleware, RequestTimeout};

/// A single middleware: wraps a router in one more layer.
pub type Wrapper = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Ordered list of wrappers applied around a site handler.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    wrappers: Vec<Wrapper>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a wrapper to this chain only.
    pub fn push<F>(&mut self, wrapper: F)
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.wrappers.push(Arc::new(wrapper));
    }

    /// Builder form of [`push`](Self::push).
    pub fn with<F>(mut self, wrapper: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.push(wrapper);
        self
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Wrap `handler` with every registered wrapper.
    pub fn apply(&self, handler: Router) -> Router {
        self.wrappers.iter().fold(handler, |router, wrap| wrap(router))
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("wrappers", &self.wrappers.len())
            .finish()
    }
}

/// Keep `guard` alive until `body` has been fully sent or dropped.
pub(crate) fn guard_body<G>(body: Body, guard: G) -> Body
where
    G: Send + Sync + 'static,
{
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Body::from_stream(stream)
}
