//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor (supervisor.rs):
//!     load sites → start generation → wait
//!         restart request / SIGHUP → reload sites → stop generation → start next
//!         shutdown / SIGINT / SIGTERM → stop generation → exit
//!
//! Shutdown (shutdown.rs):
//!     trigger → every subscriber wakes
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown
//!     SIGHUP → restart
//! ```
//!
//! # Design Decisions
//! - Restart stays in-process; plugin instances and pools are rebuilt per
//!   generation so no state leaks across configurations
//! - A generation stops listeners first, then plugins, then the access log

pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use supervisor::{PluginFactory, RestartHandle, Supervisor, SupervisorError};
