//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! sites dir (*.json) / single site file
//!     → loader.rs (parse & deserialize, object or array per file)
//!     → validation.rs (semantic checks, invalid sites dropped)
//!     → Vec<SiteConfig> (immutable for one server generation)
//!
//! settings.toml
//!     → loader.rs
//!     → ServerSettings (logging, metrics, plugin allow-list, shutdown)
//!
//! On restart:
//!     supervisor reloads the SiteSource and builds a new generation
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_settings, load_sites, ConfigError};
pub use schema::{ServerSettings, SiteConfig, SiteSource, SslConfig};
pub use validation::ValidationError;
