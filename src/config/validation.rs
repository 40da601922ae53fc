//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation of site configs (serde handles syntax)
//! - Validate value ranges (port, buffer size, upstream URL)
//! - Detect conflicting sites (same domain on the same port)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Errors are attributed to a site so invalid sites can be dropped while
//!   their siblings still start

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::SiteConfig;
use crate::proxy::buffer::MAX_BUFFER_SIZE_KB;

/// A single semantic problem in a site configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("site #{index}: domain must not be empty")]
    EmptyDomain { index: usize },

    #[error("site {domain}: port must be non-zero")]
    InvalidPort { domain: String },

    #[error("site {domain}: proxy_pass {value:?} is not a valid http URL")]
    InvalidProxyPass { domain: String, value: String },

    #[error("site {domain}: buffer_size_kb must not be negative")]
    NegativeBufferSize { domain: String },

    #[error("site {domain}: buffer_size_kb {value} exceeds the maximum of {max}")]
    BufferSizeTooLarge { domain: String, value: i64, max: i64 },

    #[error("site {domain}: ssl enabled without certificate and key paths")]
    IncompleteTls { domain: String },

    #[error("site {domain}: declared more than once on port {port}")]
    DuplicateSite { domain: String, port: u16 },
}

/// Validate a single site.
pub fn validate_site(index: usize, site: &SiteConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let domain = site.domain.clone();

    if site.domain.trim().is_empty() {
        errors.push(ValidationError::EmptyDomain { index });
    }
    if site.port == 0 {
        errors.push(ValidationError::InvalidPort { domain: domain.clone() });
    }
    if site.is_proxy() {
        let valid = url::Url::parse(site.proxy_pass.trim())
            .map(|u| u.scheme() == "http" && u.host_str().is_some())
            .unwrap_or(false);
        if !valid {
            errors.push(ValidationError::InvalidProxyPass {
                domain: domain.clone(),
                value: site.proxy_pass.clone(),
            });
        }
    }
    if site.buffer_size_kb < 0 {
        errors.push(ValidationError::NegativeBufferSize { domain: domain.clone() });
    } else if site.buffer_size_kb > MAX_BUFFER_SIZE_KB {
        errors.push(ValidationError::BufferSizeTooLarge {
            domain: domain.clone(),
            value: site.buffer_size_kb,
            max: MAX_BUFFER_SIZE_KB,
        });
    }
    if site.ssl.enabled && (site.ssl.certificate.is_empty() || site.ssl.key.is_empty()) {
        errors.push(ValidationError::IncompleteTls { domain });
    }
    errors
}

/// Validate every site and the set as a whole.
pub fn validate_sites(sites: &[SiteConfig]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, site) in sites.iter().enumerate() {
        errors.extend(validate_site(index, site));
        if !seen.insert((site.domain.to_ascii_lowercase(), site.port)) {
            errors.push(ValidationError::DuplicateSite {
                domain: site.domain.clone(),
                port: site.port,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Drop invalid sites, logging each problem, and return the rest in order.
pub fn retain_valid(sites: Vec<SiteConfig>) -> Vec<SiteConfig> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(sites.len());

    for (index, site) in sites.into_iter().enumerate() {
        let mut errors = validate_site(index, &site);
        if !seen.insert((site.domain.to_ascii_lowercase(), site.port)) {
            errors.push(ValidationError::DuplicateSite {
                domain: site.domain.clone(),
                port: site.port,
            });
        }

        if errors.is_empty() {
            kept.push(site);
            continue;
        }
        for err in &errors {
            tracing::error!(error = %err, "Invalid site configuration, site skipped");
        }
    }
    kept
}
