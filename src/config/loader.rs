//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ServerSettings, SiteConfig, SiteSource};
use crate::config::validation::retain_valid;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Parse error in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("No site configurations found in {0}")]
    Empty(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Parse site JSON holding either one object or an array of objects.
pub fn parse_sites(content: &str, origin: &str) -> Result<Vec<SiteConfig>, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|source| ConfigError::Json {
            path: origin.to_string(),
            source,
        })?;

    let parsed = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|site| vec![site])
    };
    parsed.map_err(|source| ConfigError::Json {
        path: origin.to_string(),
        source,
    })
}

/// Load every site from one JSON file.
pub fn load_site_file(path: &Path) -> Result<Vec<SiteConfig>, ConfigError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    parse_sites(&content, &path.display().to_string())
}

/// Load every `*.json` file in a directory, sorted by file name.
///
/// A file that fails to parse is logged and skipped.
pub fn load_site_dir(dir: &Path) -> Result<Vec<SiteConfig>, ConfigError> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut sites = Vec::new();
    for file in files {
        match load_site_file(&file) {
            Ok(mut loaded) => sites.append(&mut loaded),
            Err(e) => tracing::error!(error = %e, "Skipping unreadable site file"),
        }
    }
    Ok(sites)
}

/// Resolve a [`SiteSource`] into validated site configs.
///
/// Invalid sites are dropped; an empty result is an error since nothing
/// could be served.
pub fn load_sites(source: &SiteSource) -> Result<Vec<SiteConfig>, ConfigError> {
    let (sites, origin) = match source {
        SiteSource::File(path) => (load_site_file(path)?, path.display().to_string()),
        SiteSource::Directory(dir) => (load_site_dir(dir)?, dir.display().to_string()),
        SiteSource::Inline(sites) => (sites.clone(), "inline configuration".to_string()),
    };

    let sites = retain_valid(sites);
    if sites.is_empty() {
        return Err(ConfigError::Empty(origin));
    }
    tracing::info!(count = sites.len(), source = %origin, "Site configurations loaded");
    Ok(sites)
}

/// Load server settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<ServerSettings, ConfigError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    toml::from_str(&content).map_err(|source| ConfigError::Toml {
        path: path.display().to_string(),
        source,
    })
}
