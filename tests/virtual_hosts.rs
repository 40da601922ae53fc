//! Port dispatch and virtual-host routing against a live generation.

mod common;

use common::{base_url, client, site, start_generation, static_site};
use reqwest::header::HOST;

fn site_root(body: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), body).unwrap();
    dir
}

#[tokio::test]
async fn shared_port_routes_by_host() {
    let a = site_root("site a");
    let b = site_root("site b");
    let generation = start_generation(
        vec![
            static_site("a.test", a.path()),
            static_site("b.test", b.path()),
        ],
        vec![],
    )
    .await;
    let url = format!("{}/", base_url(&generation));
    let client = client();

    for (host, expected) in [
        ("a.test", "site a"),
        ("B.TEST:8080", "site b"),
        ("unknown.test", "site a"),
    ] {
        let response = client.get(&url).header(HOST, host).send().await.unwrap();
        assert_eq!(response.status(), 200, "host {host}");
        assert_eq!(response.text().await.unwrap(), expected, "host {host}");
    }

    generation.shutdown().await;
}

#[tokio::test]
async fn failed_site_is_skipped_on_shared_port() {
    let b = site_root("site b");
    let generation = start_generation(
        vec![
            static_site("a.test", std::path::Path::new("/definitely/not/here")),
            static_site("b.test", b.path()),
        ],
        vec![],
    )
    .await;
    let url = format!("{}/", base_url(&generation));

    // a.test never built, so its host falls through to the first working site.
    let response = client().get(&url).header(HOST, "a.test").send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "site b");

    generation.shutdown().await;
}

#[tokio::test]
async fn shared_port_without_sites_serves_404_page() {
    let missing = std::path::Path::new("/definitely/not/here");
    let generation = start_generation(
        vec![static_site("a.test", missing), static_site("b.test", missing)],
        vec![],
    )
    .await;

    let response = client()
        .get(format!("{}/", base_url(&generation)))
        .header(HOST, "a.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "404 Not Found");

    generation.shutdown().await;
}

#[tokio::test]
async fn generation_without_listeners_fails() {
    let result = sitegate::ServerGeneration::start(
        &[static_site("a.test", std::path::Path::new("/definitely/not/here"))],
        vec![],
        &sitegate::ServerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(sitegate::ServerError::NoListeners)));
}

#[tokio::test]
async fn rootless_site_shows_welcome_page() {
    let generation = start_generation(vec![site("a.test")], vec![]).await;
    let response = client()
        .get(format!("{}/", base_url(&generation)))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("sitegate"));

    generation.shutdown().await;
}

#[tokio::test]
async fn responses_carry_request_id_and_custom_headers() {
    let root = site_root("home");
    let mut config = static_site("a.test", root.path());
    config
        .custom_headers
        .insert("X-Frame-Options".into(), "DENY".into());
    let generation = start_generation(vec![config], vec![]).await;
    let client = client();
    let url = format!("{}/", base_url(&generation));

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(
        response.headers()["access-control-expose-headers"],
        "X-Frame-Options"
    );
    assert!(response.headers().contains_key("x-request-id"));

    let response = client
        .get(&url)
        .header("x-request-id", "fixed-id")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "fixed-id");

    generation.shutdown().await;
}
