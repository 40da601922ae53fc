//! Per-site plugin middleware.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use futures_util::FutureExt;

use crate::http::pages;
use crate::http::request::SiteDomain;
use crate::observability::metrics;
use crate::plugins::{panic_message, Plugin, PluginResult, RequestHead};

/// The active plugins of one site, in registration order.
#[derive(Clone)]
pub struct PluginPipeline {
    plugins: Arc<[Arc<dyn Plugin>]>,
    domain: Arc<str>,
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("domain", &self.domain)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PluginPipeline {
    pub fn new(domain: &str, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins: plugins.into(),
            domain: Arc::from(domain),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn contain(&self, plugin: &dyn Plugin, hook: &'static str, run: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(run)) {
            metrics::record_plugin_panic(plugin.name(), hook);
            tracing::error!(
                plugin = %plugin.name(),
                domain = %self.domain,
                hook,
                panic = %panic_message(payload.as_ref()),
                "Plugin panicked"
            );
        }
    }
}

/// Run the site's plugins around the inner handler.
///
/// Order: every `before_request`, then `handle_request` until one handles,
/// then the inner handler if none did, then every `after_request`.
pub async fn plugin_middleware(
    State(pipeline): State<PluginPipeline>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    request
        .extensions_mut()
        .insert(SiteDomain(pipeline.domain.to_string()));

    for plugin in pipeline.plugins.iter() {
        pipeline.contain(plugin.as_ref(), "before_request", || {
            plugin.before_request(&mut request)
        });
    }

    let mut handled = None;
    for plugin in pipeline.plugins.iter() {
        let outcome = AssertUnwindSafe(plugin.handle_request(&mut request))
            .catch_unwind()
            .await;
        match outcome {
            Ok(PluginResult::Continue) => {}
            Ok(PluginResult::Handled(response)) => {
                tracing::debug!(
                    plugin = %plugin.name(),
                    domain = %pipeline.domain,
                    status = %response.status(),
                    "Plugin handled request"
                );
                handled = Some(response);
                break;
            }
            Err(payload) => {
                metrics::record_plugin_panic(plugin.name(), "handle_request");
                tracing::error!(
                    plugin = %plugin.name(),
                    domain = %pipeline.domain,
                    panic = %panic_message(payload.as_ref()),
                    "Plugin panicked while handling request"
                );
                handled = Some(pages::error_response(
                    request.headers(),
                    StatusCode::INTERNAL_SERVER_ERROR,
                ));
                break;
            }
        }
    }

    let head = RequestHead::capture(&request, &pipeline.domain);
    let mut response = match handled {
        Some(response) => response,
        None => next.run(request).await,
    };

    for plugin in pipeline.plugins.iter() {
        pipeline.contain(plugin.as_ref(), "after_request", || {
            plugin.after_request(&head, &mut response)
        });
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        http::{HeaderValue, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tower::ServiceExt;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        handle: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn before_request(&self, _request: &mut Request<Body>) {
            self.journal.lock().unwrap().push(format!("{}:before", self.name));
        }

        async fn handle_request(&self, request: &mut Request<Body>) -> PluginResult {
            self.journal.lock().unwrap().push(format!("{}:handle", self.name));
            let domain = request.extensions().get::<SiteDomain>().cloned();
            assert_eq!(domain, Some(SiteDomain("a.test".into())));
            if self.handle {
                let response = Response::builder()
                    .status(StatusCode::FORBIDDEN)
                    .body(Body::from("denied"))
                    .unwrap();
                return PluginResult::Handled(response);
            }
            PluginResult::Continue
        }

        fn after_request(&self, head: &RequestHead, response: &mut Response<Body>) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:after:{}", self.name, response.status().as_u16()));
            assert_eq!(head.domain, "a.test");
            response
                .headers_mut()
                .append("x-seen-by", HeaderValue::from_static("plugin"));
        }
    }

    struct Panicker {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for Panicker {
        fn name(&self) -> &str {
            "Panicker"
        }

        fn before_request(&self, _request: &mut Request<Body>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            panic!("before");
        }

        async fn handle_request(&self, _request: &mut Request<Body>) -> PluginResult {
            panic!("handle");
        }
    }

    fn router(plugins: Vec<Arc<dyn Plugin>>, inner_hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = inner_hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "inner"
                    }
                }),
            )
            .layer(from_fn_with_state(
                PluginPipeline::new("a.test", plugins),
                plugin_middleware,
            ))
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    fn recorder(name: &'static str, journal: &Journal, handle: bool) -> Arc<dyn Plugin> {
        Arc::new(Recorder {
            name,
            journal: journal.clone(),
            handle,
        })
    }

    #[tokio::test]
    async fn hooks_run_in_order_around_inner() {
        let journal = Journal::default();
        let inner = Arc::new(AtomicUsize::new(0));
        let plugins = vec![recorder("A", &journal, false), recorder("B", &journal, false)];

        let response = router(plugins, inner.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(inner.load(Ordering::SeqCst), 1);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A:before", "B:before", "A:handle", "B:handle", "A:after:200", "B:after:200"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_but_not_after() {
        let journal = Journal::default();
        let inner = Arc::new(AtomicUsize::new(0));
        let plugins = vec![
            recorder("Gate", &journal, true),
            recorder("Later", &journal, false),
        ];

        let response = router(plugins, inner.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(inner.load(Ordering::SeqCst), 0);
        assert_eq!(response.headers().get_all("x-seen-by").iter().count(), 2);
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "Gate:before",
                "Later:before",
                "Gate:handle",
                "Gate:after:403",
                "Later:after:403"
            ]
        );
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let journal = Journal::default();
        let inner = Arc::new(AtomicUsize::new(0));
        let panicker = Arc::new(Panicker {
            hits: AtomicUsize::new(0),
        });
        let plugins: Vec<Arc<dyn Plugin>> = vec![panicker.clone(), recorder("Next", &journal, false)];

        let response = router(plugins, inner.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(panicker.hits.load(Ordering::SeqCst), 1);
        assert_eq!(inner.load(Ordering::SeqCst), 0);
        // The later plugin still saw before and after, but never handle.
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["Next:before", "Next:after:500"]
        );
    }
}
