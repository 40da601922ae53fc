//! Shared utilities for integration tests: raw-TCP mock upstreams and a
//! helper that starts a server generation on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sitegate::config::{ServerSettings, SiteConfig};
use sitegate::{Plugin, ServerGeneration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a mock upstream sends back for one request.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    pub delay: Duration,
}

impl MockResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            chunks: vec![body.into()],
            chunk_delay: Duration::ZERO,
            delay: Duration::ZERO,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Wait before writing anything.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send the body with chunked encoding, pausing between chunks.
    pub fn chunked(mut self, chunks: &[&str], pause: Duration) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.chunk_delay = pause;
        self
    }

    fn is_chunked(&self) -> bool {
        self.chunks.len() > 1 || !self.chunk_delay.is_zero()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Read the request head (request line plus headers) and discard any
/// `Content-Length` body, so closing the socket does not reset it.
async fn read_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).into_owned(),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let body_len: usize = header_value(&head, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut remaining = body_len.saturating_sub(buf.len() - head_end);
    while remaining > 0 {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => remaining = remaining.saturating_sub(n),
        }
    }
    head
}

async fn write_response(socket: &mut TcpStream, response: MockResponse) -> std::io::Result<()> {
    tokio::time::sleep(response.delay).await;

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if response.is_chunked() {
        head.push_str("Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
        socket.write_all(head.as_bytes()).await?;
        socket.flush().await?;
        for (i, chunk) in response.chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(response.chunk_delay).await;
            }
            socket
                .write_all(format!("{:x}\r\n{}\r\n", chunk.len(), chunk).as_bytes())
                .await?;
            socket.flush().await?;
        }
        socket.write_all(b"0\r\n\r\n").await?;
    } else {
        let body = response.chunks.concat();
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        socket.write_all(head.as_bytes()).await?;
    }
    socket.shutdown().await
}

/// Start a mock upstream on an ephemeral port. `respond` sees the raw
/// request head.
pub async fn start_backend<F>(respond: F) -> SocketAddr
where
    F: Fn(&str) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let _ = write_response(&mut socket, respond(&head)).await;
            });
        }
    });
    addr
}

/// Start an upstream that accepts any upgrade with 101 and then echoes
/// every byte it receives.
pub async fn start_echo_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let protocol = header_value(&head, "upgrade").unwrap_or("websocket").to_string();
                let reply = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {protocol}\r\n\r\n"
                );
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Start a mock upstream that always returns `body`.
pub async fn start_mock_backend(body: &'static str) -> SocketAddr {
    start_backend(move |_| MockResponse::ok(body)).await
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A value of header `name` in a raw request head.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// A site on port 0, so the OS picks the listener port.
pub fn site(domain: &str) -> SiteConfig {
    SiteConfig::new(domain, 0)
}

pub fn static_site(domain: &str, root: &Path) -> SiteConfig {
    let mut site = site(domain);
    site.root_directory = root.display().to_string();
    site
}

pub fn proxy_site(domain: &str, upstream: SocketAddr) -> SiteConfig {
    let mut site = site(domain);
    site.proxy_pass = format!("http://{upstream}");
    site
}

pub async fn start_generation(
    sites: Vec<SiteConfig>,
    plugins: Vec<Arc<dyn Plugin>>,
) -> ServerGeneration {
    ServerGeneration::start(&sites, plugins, &ServerSettings::default())
        .await
        .expect("generation should start")
}

/// Base URL of the generation's port-0 listener.
pub fn base_url(generation: &ServerGeneration) -> String {
    let addr = generation.local_addr(0).expect("port 0 should be bound");
    format!("http://127.0.0.1:{}", addr.port())
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
