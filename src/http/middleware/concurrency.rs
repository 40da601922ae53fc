//! Admission control: a per-site cap on in-flight requests.
//!
//! A request that cannot take a permit immediately is rejected with a 503
//! page; nothing queues. The permit rides along with the response body so
//! a slow download still counts against the cap until it finishes.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Semaphore;

use crate::http::middleware::guard_body;
use crate::http::pages;
use crate::observability::metrics;

/// Shared admission state for one site.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    domain: Arc<str>,
}

impl AdmissionControl {
    pub fn new(domain: &str, max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            domain: Arc::from(domain),
        }
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

pub async fn admission_middleware(
    State(admission): State<AdmissionControl>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let permit = match admission.semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!(
                domain = %admission.domain,
                "Concurrency limit reached, rejecting request"
            );
            metrics::record_admission_rejected(&admission.domain);
            return pages::error_response(request.headers(), StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, guard_body(body, permit))
}
