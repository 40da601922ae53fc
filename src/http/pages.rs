//! Templated pages: error pages, the landing page, directory listings.
//!
//! Every user-visible failure goes through [`error_response`], which picks
//! HTML or plain text from the request's `Accept` header. Templates are
//! compiled once per process.

use std::sync::OnceLock;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use minijinja::{context, Environment};
use serde::Serialize;

pub const BRAND: &str = "sitegate";

const STYLE: &str = include_str!("../../templates/style.css");

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        for (name, source) in [
            ("error.html", include_str!("../../templates/error.html")),
            ("welcome.html", include_str!("../../templates/welcome.html")),
            ("listing.html", include_str!("../../templates/listing.html")),
        ] {
            if let Err(e) = env.add_template(name, source) {
                tracing::error!(template = name, error = %e, "Failed to compile page template");
            }
        }
        env
    })
}

fn render(name: &str, ctx: minijinja::Value) -> Option<String> {
    let result = environment()
        .get_template(name)
        .and_then(|tmpl| tmpl.render(ctx));
    match result {
        Ok(html) => Some(html),
        Err(e) => {
            tracing::error!(template = name, error = %e, "Failed to render page");
            None
        }
    }
}

/// Title and description shown for a status code.
pub fn describe(status: StatusCode) -> (&'static str, &'static str) {
    match status {
        StatusCode::NOT_FOUND => ("Page Not Found", "The page you are looking for does not exist."),
        StatusCode::BAD_GATEWAY => ("Bad Gateway", "Unable to reach the backend server."),
        StatusCode::SERVICE_UNAVAILABLE => (
            "Service Unavailable",
            "The server is temporarily unable to handle the request. Please try again later.",
        ),
        StatusCode::METHOD_NOT_ALLOWED => (
            "Method Not Allowed",
            "The requested method is not supported for this resource.",
        ),
        StatusCode::UNAUTHORIZED => (
            "Unauthorized",
            "Valid credentials are required to access this resource.",
        ),
        StatusCode::RANGE_NOT_SATISFIABLE => (
            "Range Not Satisfiable",
            "The requested range lies outside the file.",
        ),
        _ => ("Internal Server Error", "Something went wrong on our end."),
    }
}

/// True when the client should get HTML: no `Accept` header, or one that
/// names `text/html`.
pub fn wants_html(headers: &HeaderMap) -> bool {
    match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(accept) => accept.to_ascii_lowercase().contains("text/html"),
    }
}

fn html_response(status: StatusCode, html: String) -> Response {
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn text_response(status: StatusCode, text: String) -> Response {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn plain_status(status: StatusCode) -> String {
    format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("Error"))
}

/// Render the error page for `status`, negotiated on the request headers.
pub fn error_response(request_headers: &HeaderMap, status: StatusCode) -> Response {
    if !wants_html(request_headers) {
        return text_response(status, plain_status(status));
    }
    error_page(status)
}

/// Render the HTML error page for `status`.
pub fn error_page(status: StatusCode) -> Response {
    let (title, description) = describe(status);
    let ctx = context! {
        code => status.as_u16(),
        title => title,
        description => description,
        brand => BRAND,
        styles => STYLE,
    };
    match render("error.html", ctx) {
        Some(html) => html_response(status, html),
        None => text_response(status, description.to_string()),
    }
}

/// Landing page for a site root without an index file.
pub fn welcome_page() -> Response {
    match render("welcome.html", context! { brand => BRAND, styles => STYLE }) {
        Some(html) => html_response(StatusCode::OK, html),
        None => text_response(StatusCode::OK, format!("Welcome to {BRAND}!")),
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListingEntry {
    pub name: String,
    pub href: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Directory listing, as HTML or one name per line.
pub fn listing_page(path: &str, entries: &[ListingEntry], html: bool) -> Response {
    if html {
        let ctx = context! {
            path => path,
            entries => entries,
            brand => BRAND,
            styles => STYLE,
        };
        if let Some(body) = render("listing.html", ctx) {
            return html_response(StatusCode::OK, body);
        }
    }

    let mut text = String::new();
    for entry in entries {
        text.push_str(&entry.name);
        if entry.is_dir {
            text.push('/');
        }
        text.push('\n');
    }
    text_response(StatusCode::OK, text)
}
