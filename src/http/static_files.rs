//! Static file responder.
//!
//! # Responsibilities
//! - Map a request path onto the site root without ever leaving it
//! - Serve `index.html` for directories, else a listing, welcome page or 404
//! - Prefer precompressed `.br` / `.gz` sidecars the client can accept
//! - Validators: `ETag` from size and mtime, `Last-Modified`; conditional
//!   requests answer 304
//! - Single byte ranges: 206 with `Content-Range`, 416 when unsatisfiable
//!
//! # Design Decisions
//! - The path is percent-decoded and normalized lexically; `..` pops at most
//!   back to the root
//! - Sidecar responses keep the content type of the original file
//! - Bodies are streamed from disk, never read fully into memory
//! - `If-None-Match` takes precedence over `If-Modified-Since`
//! - Multi-range and malformed `Range` headers are ignored (full 200)

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::Response,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::http::pages::{self, ListingEntry};

const STREAM_CHUNK: usize = 64 * 1024;

/// Serves files beneath one document root.
#[derive(Debug, Clone)]
pub struct StaticResponder {
    root: Arc<PathBuf>,
    file_server_mode: bool,
}

/// A file chosen to answer a request, possibly a compressed sidecar.
#[derive(Debug)]
struct Selected {
    path: PathBuf,
    metadata: std::fs::Metadata,
    encoding: Option<&'static str>,
}

impl StaticResponder {
    pub fn new(root: impl Into<PathBuf>, file_server_mode: bool) -> Self {
        Self {
            root: Arc::new(root.into()),
            file_server_mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn respond(&self, request: Request<Body>) -> Response {
        let headers = request.headers();
        let method = request.method();
        if method != Method::GET && method != Method::HEAD {
            let mut response = pages::error_response(headers, StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let raw_path = request.uri().path();
        let Some(relative) = sanitize_path(raw_path) else {
            return pages::error_response(headers, StatusCode::NOT_FOUND);
        };
        let full = self.root.join(&relative);

        let metadata = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) => return self.fs_error(headers, &full, e),
        };

        let (file, metadata) = if metadata.is_dir() {
            let index = full.join("index.html");
            match tokio::fs::metadata(&index).await {
                Ok(m) if m.is_file() => (index, m),
                _ => return self.directory(headers, raw_path, &full, relative.as_os_str().is_empty()).await,
            }
        } else {
            (full, metadata)
        };

        let selected = select_variant(&file, metadata, headers).await;
        serve_file(&file, selected, headers, method == Method::HEAD).await
    }

    async fn directory(
        &self,
        headers: &HeaderMap,
        raw_path: &str,
        dir: &Path,
        is_root: bool,
    ) -> Response {
        if self.file_server_mode {
            if !raw_path.ends_with('/') {
                return redirect(&format!("{raw_path}/"));
            }
            return match list_directory(dir).await {
                Ok(entries) => {
                    let display = urlencoding::decode(raw_path)
                        .map(|p| p.into_owned())
                        .unwrap_or_else(|_| raw_path.to_string());
                    pages::listing_page(&display, &entries, pages::wants_html(headers))
                }
                Err(e) => self.fs_error(headers, dir, e),
            };
        }
        if is_root {
            return pages::welcome_page();
        }
        pages::error_response(headers, StatusCode::NOT_FOUND)
    }

    fn fs_error(&self, headers: &HeaderMap, path: &Path, error: io::Error) -> Response {
        if error.kind() == io::ErrorKind::NotFound {
            return pages::error_response(headers, StatusCode::NOT_FOUND);
        }
        tracing::warn!(
            root = %self.root.display(),
            path = %path.display(),
            error = %error,
            "Static file lookup failed"
        );
        pages::error_response(headers, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Decode and normalize a URL path into a root-relative file path.
///
/// Returns `None` for paths that cannot name a file (bad escapes, NUL).
pub fn sanitize_path(raw: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(raw).ok()?;
    let mut parts: Vec<&str> = Vec::new();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s if s.contains('\0') => return None,
            s => parts.push(s),
        }
    }
    Some(parts.iter().collect())
}

/// Strong validator of a file: `"<size hex>-<mtime ns hex>"`.
pub fn etag(metadata: &std::fs::Metadata) -> String {
    let nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", metadata.len(), nanos)
}

fn accepts(headers: &HeaderMap, coding: &str) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(coding))
}

async fn sidecar(file: &Path, suffix: &str) -> Option<(PathBuf, std::fs::Metadata)> {
    let mut name = file.as_os_str().to_owned();
    name.push(suffix);
    let path = PathBuf::from(name);
    match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => Some((path, m)),
        _ => None,
    }
}

async fn select_variant(file: &Path, metadata: std::fs::Metadata, headers: &HeaderMap) -> Selected {
    for (coding, suffix) in [("br", ".br"), ("gzip", ".gz")] {
        if !accepts(headers, coding) {
            continue;
        }
        if let Some((path, metadata)) = sidecar(file, suffix).await {
            return Selected {
                path,
                metadata,
                encoding: Some(coding),
            };
        }
    }
    Selected {
        path: file.to_path_buf(),
        metadata,
        encoding: None,
    }
}

fn content_type(file: &Path) -> HeaderValue {
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    let value = if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    };
    HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("application/octet-stream"))
}

fn etag_matches(headers: &HeaderMap, tag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().trim_start_matches("W/"))
        .any(|candidate| candidate == "*" || candidate == tag)
}

/// Modification time at the one-second resolution of HTTP dates.
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn not_modified(headers: &HeaderMap, tag: &str, modified: Option<SystemTime>) -> bool {
    if headers.contains_key(header::IF_NONE_MATCH) {
        return etag_matches(headers, tag);
    }
    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok());
    match (since, modified) {
        (Some(since), Some(modified)) => truncate_to_seconds(modified) <= since,
        _ => false,
    }
}

/// Inclusive byte range of a representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// How a `Range` header applies to a representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Interpret a `Range` header value against `size` bytes.
///
/// Only a single `bytes=` range is honoured; anything else serves the whole
/// representation.
pub fn parse_range(value: &str, size: u64) -> RangeRequest {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: size - suffix.min(size),
            end: size - 1,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return RangeRequest::Full,
        }
    };
    if start >= size {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial(ByteRange {
        start,
        end: end.min(size - 1),
    })
}

/// `If-Range` holds when it names the current ETag or Last-Modified date.
fn if_range_holds(headers: &HeaderMap, tag: &str, last_modified: Option<&str>) -> bool {
    match headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(value) => {
            let value = value.trim();
            value == tag || Some(value) == last_modified
        }
    }
}

async fn open_body(path: &Path, range: Option<ByteRange>) -> io::Result<Body> {
    let mut file = tokio::fs::File::open(path).await?;
    let body = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            Body::from_stream(ReaderStream::with_capacity(file.take(range.len()), STREAM_CHUNK))
        }
        None => Body::from_stream(ReaderStream::with_capacity(file, STREAM_CHUNK)),
    };
    Ok(body)
}

async fn serve_file(original: &Path, selected: Selected, headers: &HeaderMap, head_only: bool) -> Response {
    let tag = etag(&selected.metadata);
    let modified = selected.metadata.modified().ok();
    let last_modified = modified.map(httpdate::fmt_http_date);
    let size = selected.metadata.len();

    let mut response = Response::new(Body::empty());
    let out = response.headers_mut();
    out.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    if let Ok(value) = HeaderValue::from_str(&tag) {
        out.insert(header::ETAG, value);
    }
    if let Some(value) = last_modified.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        out.insert(header::LAST_MODIFIED, value);
    }

    if not_modified(headers, &tag, modified) {
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        return response;
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if if_range_holds(headers, &tag, last_modified.as_deref()) => {
            parse_range(value, size)
        }
        _ => RangeRequest::Full,
    };

    let range = match range {
        RangeRequest::Full => None,
        RangeRequest::Partial(range) => Some(range),
        RangeRequest::Unsatisfiable => {
            let mut rejected = pages::error_response(headers, StatusCode::RANGE_NOT_SATISFIABLE);
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                rejected.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return rejected;
        }
    };

    if range.is_some() {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }
    let out = response.headers_mut();
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(header::CONTENT_TYPE, content_type(original));
    if let Some(coding) = selected.encoding {
        out.insert(header::CONTENT_ENCODING, HeaderValue::from_static(coding));
    }
    match range {
        Some(range) => {
            out.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {}-{}/{size}", range.start, range.end))
            {
                out.insert(header::CONTENT_RANGE, value);
            }
        }
        None => {
            out.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        }
    }

    if head_only {
        return response;
    }

    match open_body(&selected.path, range).await {
        Ok(body) => {
            *response.body_mut() = body;
            response
        }
        Err(e) => {
            tracing::warn!(path = %selected.path.display(), error = %e, "Failed to open file");
            pages::error_response(headers, StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_directory(dir: &Path) -> io::Result<Vec<ListingEntry>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let is_dir = metadata.is_dir();
        let mut href = urlencoding::encode(&name).into_owned();
        if is_dir {
            href.push('/');
        }
        entries.push(ListingEntry {
            name,
            href,
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn redirect(location: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn get(responder: &StaticResponder, path: &str, headers: &[(&str, &str)]) -> Response {
        responder.respond(request(Method::GET, path, headers)).await
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn site_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        fs::write(dir.path().join("app.js.gz"), b"\x1f\x8bgz").unwrap();
        fs::write(dir.path().join("app.js.br"), b"br-bytes").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        dir
    }

    #[test]
    fn traversal_cannot_escape_root() {
        assert_eq!(sanitize_path("/../../etc/passwd"), Some(PathBuf::from("etc/passwd")));
        assert_eq!(sanitize_path("/a/%2e%2e/%2e%2e/b"), Some(PathBuf::from("b")));
        assert_eq!(sanitize_path("/a\\..\\..\\b"), Some(PathBuf::from("b")));
        assert_eq!(sanitize_path("/"), Some(PathBuf::new()));
        assert_eq!(sanitize_path("/bad%00name"), None);
    }

    #[tokio::test]
    async fn serves_file_with_validators() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let response = get(&responder, "/hello.txt", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");

        let metadata = fs::metadata(root.path().join("hello.txt")).unwrap();
        let tag = etag(&metadata);
        assert!(tag.starts_with("\"b-"));
        assert_eq!(response.headers()[header::ETAG], tag.as_str());
        assert_eq!(body_string(response).await, "hello world");

        let cached = get(&responder, "/hello.txt", &[("if-none-match", tag.as_str())]).await;
        assert_eq!(cached.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(body_string(cached).await, "");
    }

    #[test]
    fn range_header_forms() {
        let full = |v| parse_range(v, 100);
        let part = |start, end| RangeRequest::Partial(ByteRange { start, end });
        assert_eq!(full("bytes=0-9"), part(0, 9));
        assert_eq!(full("bytes=90-"), part(90, 99));
        assert_eq!(full("bytes=95-200"), part(95, 99));
        assert_eq!(full("bytes=-10"), part(90, 99));
        assert_eq!(full("bytes=-500"), part(0, 99));
        assert_eq!(full("bytes=100-"), RangeRequest::Unsatisfiable);
        assert_eq!(full("bytes=-0"), RangeRequest::Unsatisfiable);
        assert_eq!(full("bytes=0-1,5-6"), RangeRequest::Full);
        assert_eq!(full("bytes=9-3"), RangeRequest::Full);
        assert_eq!(full("items=0-1"), RangeRequest::Full);
        assert_eq!(parse_range("bytes=0-", 0), RangeRequest::Unsatisfiable);
    }

    #[tokio::test]
    async fn last_modified_and_if_modified_since() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let response = get(&responder, "/hello.txt", &[]).await;
        let stamp = response.headers()[header::LAST_MODIFIED]
            .to_str()
            .unwrap()
            .to_string();
        assert!(httpdate::parse_http_date(&stamp).is_ok());

        let cached = get(&responder, "/hello.txt", &[("if-modified-since", stamp.as_str())]).await;
        assert_eq!(cached.status(), StatusCode::NOT_MODIFIED);

        let old = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(86_400));
        let stale = get(&responder, "/hello.txt", &[("if-modified-since", old.as_str())]).await;
        assert_eq!(stale.status(), StatusCode::OK);

        // A non-matching ETag wins over a satisfied date.
        let mismatch = get(
            &responder,
            "/hello.txt",
            &[("if-none-match", "\"other\""), ("if-modified-since", stamp.as_str())],
        )
        .await;
        assert_eq!(mismatch.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_single_ranges() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let part = get(&responder, "/hello.txt", &[("range", "bytes=6-")]).await;
        assert_eq!(part.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(part.headers()[header::CONTENT_RANGE], "bytes 6-10/11");
        assert_eq!(part.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(body_string(part).await, "world");

        let refused = get(&responder, "/hello.txt", &[("range", "bytes=50-60")]).await;
        assert_eq!(refused.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(refused.headers()[header::CONTENT_RANGE], "bytes */11");

        let stale = get(
            &responder,
            "/hello.txt",
            &[("range", "bytes=0-4"), ("if-range", "\"stale\"")],
        )
        .await;
        assert_eq!(stale.status(), StatusCode::OK);
        assert_eq!(body_string(stale).await, "hello world");
    }

    #[tokio::test]
    async fn prefers_brotli_then_gzip_sidecar() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let br = get(&responder, "/app.js", &[("accept-encoding", "gzip, br")]).await;
        assert_eq!(br.headers()[header::CONTENT_ENCODING], "br");
        assert!(br.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("javascript"));
        assert_eq!(body_string(br).await, "br-bytes");

        let gz = get(&responder, "/app.js", &[("accept-encoding", "gzip")]).await;
        assert_eq!(gz.headers()[header::CONTENT_ENCODING], "gzip");

        let plain = get(&responder, "/app.js", &[]).await;
        assert!(plain.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(body_string(plain).await, "console.log(1)");
    }

    #[tokio::test]
    async fn directories_resolve_index_welcome_or_404() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let docs = get(&responder, "/docs/", &[]).await;
        assert_eq!(body_string(docs).await, "<h1>docs</h1>");

        let welcome = get(&responder, "/", &[]).await;
        assert_eq!(welcome.status(), StatusCode::OK);
        assert!(body_string(welcome).await.contains("sitegate"));

        let empty = get(&responder, "/empty/", &[]).await;
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);

        let missing = get(&responder, "/nope.txt", &[("accept", "text/plain")]).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(missing).await, "404 Not Found");
    }

    #[tokio::test]
    async fn file_server_mode_lists_directories() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), true);

        let listing = get(&responder, "/", &[("accept", "text/plain")]).await;
        assert_eq!(listing.status(), StatusCode::OK);
        let text = body_string(listing).await;
        assert!(text.contains("hello.txt\n"));
        assert!(text.contains("docs/\n"));

        let html = get(&responder, "/", &[("accept", "text/html")]).await;
        assert!(body_string(html).await.contains("href=\"hello.txt\""));

        let redirect = get(&responder, "/empty", &[]).await;
        assert_eq!(redirect.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(redirect.headers()[header::LOCATION], "/empty/");
    }

    #[tokio::test]
    async fn head_and_method_rules() {
        let root = site_root();
        let responder = StaticResponder::new(root.path(), false);

        let head = responder.respond(request(Method::HEAD, "/hello.txt", &[])).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(body_string(head).await, "");

        let post = responder.respond(request(Method::POST, "/hello.txt", &[])).await;
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(post.headers()[header::ALLOW], "GET, HEAD");
    }
}
