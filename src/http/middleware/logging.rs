//! Access-log producer stage.
//!
//! Registered last, so it is outermost: the duration covers every other
//! stage and the status is the one the client receives.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::http::request::client_ip;
use crate::observability::access_log::{AsyncLogger, SiteLogger};
use crate::observability::metrics;

pub const ACCESS_LOG_MESSAGE: &str = "Handled request";

#[derive(Debug, Clone)]
pub struct AccessLog {
    logger: Arc<AsyncLogger>,
    site_logger: Arc<SiteLogger>,
    domain: Arc<str>,
}

impl AccessLog {
    pub fn new(logger: Arc<AsyncLogger>, site_logger: Arc<SiteLogger>, domain: &str) -> Self {
        Self {
            logger,
            site_logger,
            domain: Arc::from(domain),
        }
    }
}

pub async fn access_log_middleware(
    State(log): State<AccessLog>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let url = request.uri().to_string();
    let remote_addr = client_ip(&request);

    let response = next.run(request).await;
    let status = response.status().as_u16();
    metrics::record_request(&log.domain, status, start);

    let mut entry = log.logger.acquire();
    entry.logger = Some(log.site_logger.clone());
    entry.identifier.push_str(log.site_logger.identifier());
    entry.message.push_str(ACCESS_LOG_MESSAGE);
    entry.set("method", method);
    entry.set("url", url);
    entry.set("remote_addr", remote_addr);
    entry.set("status_code", status);
    entry.set("duration_sec", start.elapsed().as_secs_f64());
    entry.set("domain", &*log.domain);
    log.logger.submit(entry);

    response
}
