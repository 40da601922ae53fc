//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, `RUST_LOG` filtering)
//!     → metrics.rs (counters, histograms)
//!
//! Request pipeline produces:
//!     → access_log.rs (bounded queue → background writer → monitors)
//! ```
//!
//! # Design Decisions
//! - Access logging never blocks a request; overflow is counted and dropped
//! - Metrics are cheap (atomic increments), no-ops without an exporter
//! - Per-site context is carried as fields, not separate subscribers

pub mod access_log;
pub mod logging;
pub mod metrics;

pub use access_log::{AsyncLogger, LogEntry, LoggerRegistry, SiteLogger};
