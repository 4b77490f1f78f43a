//! End-to-end tests for the routed gateway.
//!
//! Each test binds a real [`Server`] on an ephemeral port, points the
//! forwarder at a wiremock upstream and talks to it with `reqwest`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashgate::auth::{ProviderFactory, StaticTokenProvider, TokenProvider};
use dashgate::{App, GatewayConfig, Server, TokenSource};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn static_factory(token: &'static str) -> ProviderFactory {
    Box::new(move |_audience: &str| {
        let provider: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token));
        Ok(provider)
    })
}

fn dist() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<!doctype html><div id=root></div>").unwrap();
    std::fs::create_dir_all(dir.path().join("assets")).unwrap();
    std::fs::write(dir.path().join("assets/index.css"), "body{margin:0}").unwrap();
    dir
}

fn config(upstream: &str, static_dir: &std::path::Path) -> GatewayConfig {
    GatewayConfig::new(upstream, "https://api.example.run.app")
        .unwrap()
        .with_host("127.0.0.1")
        .with_port(0)
        .with_static_dir(static_dir)
        .with_upstream_timeout(Duration::from_secs(2))
}

async fn spawn(app: App) -> SocketAddr {
    let app = Arc::new(app);
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(move |req| {
        let app = Arc::clone(&app);
        async move { app.handle(req).await }
    }));
    addr
}

async fn gateway(upstream: &str, static_dir: &std::path::Path, token: &'static str) -> SocketAddr {
    let app = App::with_provider_factory(&config(upstream, static_dir), static_factory(token)).unwrap();
    spawn(app).await
}

// ── Forwarding ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_db_is_relayed_unmodified() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping-db"))
        .and(header("authorization", "Bearer id-token"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"status":"ok"}"#, "application/json"))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "id-token").await;

    let res = reqwest::get(format!("http://{addr}/api/ping-db")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(res.text().await.unwrap(), r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn login_failure_status_and_body_pass_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"email": "a@b.com", "password": "x"})))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid credentials"))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "id-token").await;

    let res = reqwest::Client::new()
        .post(format!("http://{addr}/api/login"))
        .json(&json!({"email": "a@b.com", "password": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(res.text().await.unwrap(), "Invalid credentials");
}

#[tokio::test]
async fn prefix_is_stripped_once_and_query_kept() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/devices"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "id-token").await;

    let res = reqwest::get(format!("http://{addr}/api/api/v1/devices?page=2"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn only_content_type_and_authorization_are_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/actions/block-ip"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "id-token").await;

    let res = reqwest::Client::new()
        .put(format!("http://{addr}/api/v1/actions/block-ip"))
        .header("content-type", "application/json")
        .header("cookie", "session=abc")
        .header("authorization", "Bearer browser-token")
        .header("x-dashboard-user", "admin")
        .body(r#"{ "ip" : "10.0.0.7" }"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let req = &received[0];
    assert_eq!(req.headers.get("authorization").unwrap(), "Bearer id-token");
    assert_eq!(req.headers.get("content-type").unwrap(), "application/json");
    assert!(req.headers.get("cookie").is_none());
    assert!(req.headers.get("x-dashboard-user").is_none());
    // Re-serialized, not copied byte for byte.
    assert_eq!(req.body, br#"{"ip":"10.0.0.7"}"#);
}

#[tokio::test]
async fn get_never_carries_a_body() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/logs/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "id-token").await;

    let res = reqwest::Client::new()
        .get(format!("http://{addr}/api/v1/logs/alerts"))
        .header("content-type", "application/json")
        .body(r#"{"ignored":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let received = upstream.received_requests().await.unwrap();
    assert!(received[0].body.is_empty());
}

#[tokio::test]
async fn empty_token_fails_closed_without_calling_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let dir = dist();
    let addr = gateway(&upstream.uri(), dir.path(), "").await;

    let res = reqwest::get(format!("http://{addr}/api/v1/devices")).await.unwrap();
    assert_eq!(res.status(), 500);
    assert!(
        res.text()
            .await
            .unwrap()
            .starts_with("Failed to authenticate proxy request: ")
    );
}

#[tokio::test]
async fn auth_detail_is_hidden_when_disabled() {
    let dir = dist();
    let cfg = config("http://127.0.0.1:9", dir.path()).with_error_details(false);
    let addr = spawn(App::with_provider_factory(&cfg, static_factory("")).unwrap()).await;

    let res = reqwest::get(format!("http://{addr}/api/ping-db")).await.unwrap();
    assert_eq!(res.status(), 500);
    assert_eq!(res.text().await.unwrap(), "Failed to authenticate proxy request");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let dir = dist();
    let addr = gateway(&target, dir.path(), "id-token").await;

    let res = reqwest::get(format!("http://{addr}/api/ping-db")).await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.text().await.unwrap(), "Proxy encountered an error.");
}

#[tokio::test]
async fn slow_upstream_is_gateway_timeout() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&upstream)
        .await;

    let dir = dist();
    let cfg = config(&upstream.uri(), dir.path()).with_upstream_timeout(Duration::from_millis(200));
    let addr = spawn(App::with_provider_factory(&cfg, static_factory("t")).unwrap()).await;

    let res = reqwest::get(format!("http://{addr}/api/ping-db")).await.unwrap();
    assert_eq!(res.status(), 504);
}

#[tokio::test]
async fn metadata_token_source_end_to_end() {
    let metadata = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/instance/service-accounts/default/identity"))
        .and(header("metadata-flavor", "Google"))
        .and(query_param("audience", "https://api.example.run.app"))
        .respond_with(ResponseTemplate::new(200).set_body_string("metadata-token"))
        .mount(&metadata)
        .await;

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/devices"))
        .and(header("authorization", "Bearer metadata-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = dist();
    let cfg = config(&upstream.uri(), dir.path()).with_token_source(TokenSource::Metadata {
        host: metadata.address().to_string(),
    });
    let app = App::new(&cfg).unwrap();
    assert!(!app.tokens().is_initialized());
    let app = Arc::new(app);

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let handle = Arc::clone(&app);
    tokio::spawn(server.run(move |req| {
        let app = Arc::clone(&handle);
        async move { app.handle(req).await }
    }));

    let res = reqwest::get(format!("http://{addr}/api/v1/devices")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(app.tokens().is_initialized());
}

// ── SPA ───────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_routes_get_the_entry_document() {
    let dir = dist();
    let addr = gateway("http://127.0.0.1:9", dir.path(), "t").await;

    for route in ["/", "/devices", "/logs/alerts", "/apifoo"] {
        let res = reqwest::get(format!("http://{addr}{route}")).await.unwrap();
        assert_eq!(res.status(), 200, "{route}");
        assert_eq!(
            res.text().await.unwrap(),
            "<!doctype html><div id=root></div>",
            "{route}"
        );
    }
}

#[tokio::test]
async fn static_assets_are_served_literally() {
    let dir = dist();
    let addr = gateway("http://127.0.0.1:9", dir.path(), "t").await;

    let res = reqwest::get(format!("http://{addr}/assets/index.css")).await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers()["content-type"].to_str().unwrap().starts_with("text/css"));
    assert_eq!(res.text().await.unwrap(), "body{margin:0}");
}

#[tokio::test]
async fn missing_entry_document_is_server_error() {
    let empty = tempfile::tempdir().unwrap();
    let addr = gateway("http://127.0.0.1:9", empty.path(), "t").await;

    let res = reqwest::get(format!("http://{addr}/devices")).await.unwrap();
    assert_eq!(res.status(), 500);
    assert_eq!(
        res.text().await.unwrap(),
        "Internal server error: index.html not found."
    );
}

#[tokio::test]
async fn other_methods_outside_prefix_are_not_found() {
    let dir = dist();
    let addr = gateway("http://127.0.0.1:9", dir.path(), "t").await;

    let res = reqwest::Client::new()
        .post(format!("http://{addr}/devices"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}
