//! Request timeout stage.
//!
//! Bounds total handler time. On expiry the inner future is dropped (which
//! cancels upstream work and releases any permits it held) and the client
//! receives a 503 page.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::pages;
use crate::observability::metrics;

#[derive(Debug, Clone)]
pub struct RequestTimeout {
    duration: Duration,
    domain: Arc<str>,
}

impl RequestTimeout {
    pub fn new(domain: &str, duration: Duration) -> Self {
        Self {
            duration,
            domain: Arc::from(domain),
        }
    }
}

pub async fn timeout_middleware(
    State(timeout): State<RequestTimeout>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut negotiation = HeaderMap::new();
    if let Some(accept) = request.headers().get(axum::http::header::ACCEPT) {
        negotiation.insert(axum::http::header::ACCEPT, accept.clone());
    }

    match tokio::time::timeout(timeout.duration, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                domain = %timeout.domain,
                timeout = ?timeout.duration,
                "Request timed out"
            );
            metrics::record_timeout(&timeout.domain);
            pages::error_response(&negotiation, StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use tower::ServiceExt;

    fn router(delay: Duration, limit: Duration) -> Router {
        Router::new()
            .route(
                "/",
                get(move || async move {
                    tokio::time::sleep(delay).await;
                    "slow"
                }),
            )
            .layer(from_fn_with_state(
                RequestTimeout::new("a.test", limit),
                timeout_middleware,
            ))
    }

    #[tokio::test]
    async fn expires_with_503() {
        let response = router(Duration::from_millis(500), Duration::from_millis(50))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn fast_handler_passes() {
        let response = router(Duration::from_millis(1), Duration::from_secs(1))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
