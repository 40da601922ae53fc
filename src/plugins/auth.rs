//! HTTP Basic authentication for protected path prefixes.
//!
//! Site block:
//! ```json
//! "AuthPlugin": {
//!     "enable": true,
//!     "protected_paths": ["/admin"],
//!     "credentials": { "alice": "secret" },
//!     "session_expiration": 3600
//! }
//! ```
//!
//! A successful login opens a session for the client address, so later
//! requests from that address pass without credentials until it expires.
//! `session_expiration` is in seconds, at most 86400; -1 never expires.
//!
//! # Security
//! The client address is taken from `X-Real-IP`, then the first
//! `X-Forwarded-For` entry, then the socket peer. Any client that can set
//! those headers can claim a logged-in address and ride its session. Only
//! enable sessions when a trusted proxy in front of this server overwrites
//! both headers, or set `session_expiration` to 0 so every request must
//! carry credentials.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use serde::Deserialize;

use crate::config::SiteConfig;
use crate::http::pages;
use crate::http::request::{client_ip, SiteDomain};
use crate::plugins::{Plugin, PluginError, PluginLogger, PluginResult};

const NAME: &str = "AuthPlugin";
const MAX_SESSION_SECS: i64 = 86_400;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enable: bool,
    pub protected_paths: Vec<String>,
    pub credentials: HashMap<String, String>,
    pub session_expiration: i64,
}

impl AuthConfig {
    fn validate(&self) -> Result<(), PluginError> {
        if self.session_expiration > MAX_SESSION_SECS {
            return Err(PluginError::failed(
                NAME,
                "session_expiration cannot exceed 86400 seconds",
            ));
        }
        if self.session_expiration < -1 {
            return Err(PluginError::failed(
                NAME,
                "session_expiration cannot be less than -1",
            ));
        }
        Ok(())
    }

    fn protects(&self, path: &str) -> bool {
        self.protected_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn session_ttl(&self) -> Option<Duration> {
        (self.session_expiration != -1).then(|| Duration::from_secs(self.session_expiration as u64))
    }
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    expires: Option<Instant>,
}

impl Session {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct SiteAuth {
    config: AuthConfig,
    sessions: RwLock<HashMap<String, Session>>,
    logger: PluginLogger,
}

impl SiteAuth {
    fn session(&self, ip: &str) -> Option<Session> {
        let sessions = self.sessions.read().ok()?;
        sessions
            .get(ip)
            .filter(|s| s.is_live(Instant::now()))
            .cloned()
    }

    fn open_session(&self, ip: &str, username: &str) {
        let expires = self.config.session_ttl().map(|ttl| Instant::now() + ttl);
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(
                ip.to_string(),
                Session {
                    username: username.to_string(),
                    expires,
                },
            );
        }
        match expires {
            Some(_) => self.logger.info(&format!(
                "Created session ip={ip} user={username} ttl={}s",
                self.config.session_expiration
            )),
            None => self
                .logger
                .info(&format!("Created session ip={ip} user={username} (no expiry)")),
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut sessions) = self.sessions.write() else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|ip, session| {
            let live = session.is_live(now);
            if !live {
                self.logger.info(&format!(
                    "Session expired ip={ip} user={}",
                    session.username
                ));
            }
            live
        });
        before - sessions.len()
    }
}

/// Basic-auth gate with per-client sessions, configured per site.
///
/// Sessions are keyed by the header-derived client address, which is only
/// as trustworthy as the proxy in front; see the module docs.
#[derive(Debug, Default)]
pub struct AuthPlugin {
    sites: DashMap<String, Arc<SiteAuth>>,
}

impl AuthPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn site(&self, domain: &str) -> Option<Arc<SiteAuth>> {
        self.sites.get(domain).map(|entry| entry.value().clone())
    }
}

fn spawn_cleanup(state: Weak<SiteAuth>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            state.purge_expired();
        }
    });
}

/// Decode a `Basic` authorization value into `(user, password)`.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn unauthorized(request: &Request<Body>) -> PluginResult {
    let mut response = pages::error_response(request.headers(), StatusCode::UNAUTHORIZED);
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Restricted\""),
    );
    PluginResult::Handled(response)
}

#[async_trait]
impl Plugin for AuthPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn on_init_for_site(
        &self,
        site: &SiteConfig,
        logger: PluginLogger,
    ) -> Result<(), PluginError> {
        self.sites.remove(&site.domain);
        let Some(raw) = site.plugin_config(NAME) else {
            return Ok(());
        };

        let config: AuthConfig = serde_json::from_value(raw.clone())
            .map_err(|e| PluginError::failed(NAME, format!("invalid config: {e}")))?;
        config.validate()?;
        if !config.enable {
            return Ok(());
        }

        logger.info(&format!(
            "Initialized with session_expiration={}",
            config.session_expiration
        ));
        let expires = config.session_ttl().is_some();
        let state = Arc::new(SiteAuth {
            config,
            sessions: RwLock::new(HashMap::new()),
            logger,
        });
        if expires {
            spawn_cleanup(Arc::downgrade(&state));
        }
        self.sites.insert(site.domain.clone(), state);
        Ok(())
    }

    async fn handle_request(&self, request: &mut Request<Body>) -> PluginResult {
        let Some(SiteDomain(domain)) = request.extensions().get::<SiteDomain>() else {
            return PluginResult::Continue;
        };
        let Some(site) = self.site(domain) else {
            return PluginResult::Continue;
        };
        if site.config.credentials.is_empty() || !site.config.protects(request.uri().path()) {
            return PluginResult::Continue;
        }

        let ip = client_ip(&*request);
        if let Some(session) = site.session(&ip) {
            site.logger
                .debug(&format!("Valid session ip={ip} user={}", session.username));
            return PluginResult::Continue;
        }

        let Some((user, password)) = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic)
        else {
            return unauthorized(request);
        };

        match site.config.credentials.get(&user) {
            Some(expected) if *expected == password => {
                site.open_session(&ip, &user);
                PluginResult::Continue
            }
            _ => {
                site.logger.warn(&format!("Rejected credentials ip={ip} user={user}"));
                unauthorized(request)
            }
        }
    }

    async fn on_exit(&self) -> Result<(), PluginError> {
        self.sites.clear();
        Ok(())
    }
}
