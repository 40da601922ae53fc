//! Shared reverse-proxy pool.
//!
//! # Responsibilities
//! - Hand out one `ReverseProxy` per distinct transport configuration
//! - Share the upstream client and the default buffer pool across proxies
//!
//! # Design Decisions
//! - Key = (target, flush interval, buffer size); sites with the same key
//!   share connection reuse and buffers
//! - One mutex over the map; lookups happen at site-build time, not per request

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::SiteConfig;
use crate::proxy::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::proxy::reverse_proxy::{build_client, FlushPolicy, HttpClient, ProxyError, ReverseProxy};

/// Identity of a proxy transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyKey {
    pub target: String,
    pub flush_interval: String,
    pub buffer_size_kb: i64,
}

impl ProxyKey {
    pub fn for_site(site: &SiteConfig) -> Self {
        Self {
            target: site.proxy_pass.trim().to_string(),
            flush_interval: site.flush_interval.trim().to_string(),
            buffer_size_kb: site.buffer_size_kb,
        }
    }
}

/// Config-keyed pool of reverse proxies for one server generation.
#[derive(Debug)]
pub struct ProxyPool {
    proxies: Mutex<HashMap<ProxyKey, Arc<ReverseProxy>>>,
    client: HttpClient,
    default_buffers: Arc<BufferPool>,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyPool {
    pub fn new() -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
            client: build_client(),
            default_buffers: BufferPool::new(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Return the proxy for this site's key, creating it on first use.
    pub fn get_or_create(&self, site: &SiteConfig) -> Result<Arc<ReverseProxy>, ProxyError> {
        let key = ProxyKey::for_site(site);
        let mut proxies = self.proxies.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = proxies.get(&key) {
            return Ok(existing.clone());
        }

        let buffers = BufferPool::for_site(site.buffer_size_kb)
            .unwrap_or_else(|| self.default_buffers.clone());
        let proxy = Arc::new(ReverseProxy::new(
            &key.target,
            self.client.clone(),
            FlushPolicy::parse(&key.flush_interval),
            buffers,
        )?);

        tracing::debug!(
            domain = %site.domain,
            upstream = %key.target,
            flush = ?proxy.flush_policy(),
            buffer_bytes = proxy.buffer_size(),
            "Created reverse proxy"
        );
        proxies.insert(key, proxy.clone());
        Ok(proxy)
    }

    /// Number of distinct proxies created.
    pub fn len(&self) -> usize {
        self.proxies.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
