//! Control-server integration tests.
//!
//! Each test spins up a stub build API and a daemon on a free port, then
//! talks to the control endpoints the way an SDK would. Discovery paths that
//! need a real Chrome live in tests/discovery.rs instead; here the browser
//! executable points at a path that cannot exist, so launch errors surface
//! deterministically.

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use percyd::{server, Config, PercyDaemon};

/// Find a free local port by binding to port 0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal JSON:API stub standing in for the remote build service.
async fn start_stub_api() -> String {
    let app = Router::new()
        .route(
            "/builds",
            post(|| async {
                Json(json!({
                    "data": {
                        "id": "build-1",
                        "attributes": {
                            "build-number": 7,
                            "web-url": "https://percy.local/builds/7"
                        }
                    }
                }))
            }),
        )
        .route(
            "/builds/:id/snapshots",
            post(|| async { Json(json!({ "data": { "id": "snap-1" } })) }),
        )
        .route(
            "/builds/:id/resources",
            post(|| async { Json(json!({ "success": true })) }),
        )
        .route(
            "/builds/:id/finalize",
            post(|| async { Json(json!({ "success": true })) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}")
}

fn test_config(api_url: String, port: u16) -> Config {
    let mut config = Config {
        token: "web_test_token".to_string(),
        api_url,
        port,
        ..Config::default()
    };
    // Deterministic launch failure instead of a real (or downloaded) browser.
    config.discovery.browser_executable = Some("/nonexistent/percyd-chromium".to_string());
    config
}

async fn start_daemon() -> (Arc<PercyDaemon>, String) {
    let api_url = start_stub_api().await;
    let port = free_port();
    let daemon = PercyDaemon::new(test_config(api_url, port), None).unwrap();
    daemon.start().await.unwrap();
    (daemon, format!("http://127.0.0.1:{port}"))
}

#[tokio::test]
async fn healthcheck_reports_build_and_config() {
    let (daemon, base) = start_daemon().await;
    let body: Value = reqwest::get(format!("{base}/percy/healthcheck"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["build"]["id"], "build-1");
    assert_eq!(body["build"]["number"], 7);
    assert_eq!(body["config"]["snapshot"]["widths"], json!([375, 1280]));
    assert!(body["config"].get("token").is_none(), "token must be redacted");
    assert!(body["loglevel"].is_string());
    daemon.stop().await;
}

#[tokio::test]
async fn dom_js_serves_the_bundled_script_exactly() {
    let (daemon, base) = start_daemon().await;
    let response = reqwest::get(format!("{base}/percy/dom.js")).await.unwrap();
    assert_eq!(
        response.headers()["content-type"],
        "application/javascript"
    );
    let body = response.text().await.unwrap();
    assert_eq!(body, server::DOM_JS);
    daemon.stop().await;
}

#[tokio::test]
async fn unknown_paths_get_404_not_found() {
    let (daemon, base) = start_daemon().await;
    let response = reqwest::get(format!("{base}/percy/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Not found");
    daemon.stop().await;
}

#[tokio::test]
async fn invalid_snapshot_payload_is_a_500() {
    let (daemon, base) = start_daemon().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/percy/snapshot"))
        .body("{\"url\": \"missing name\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("payload"));
    daemon.stop().await;
}

#[tokio::test]
async fn concurrent_snapshot_returns_before_the_job_resolves() {
    let (daemon, base) = start_daemon().await;
    let client = reqwest::Client::new();
    // The browser executable is unreachable, so the queued job must fail;
    // the response still succeeds because enqueueing did.
    let response = client
        .post(format!("{base}/percy/snapshot"))
        .json(&json!({ "name": "home", "url": "http://localhost:9/" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    daemon.idle().await;
    daemon.stop().await;
}

#[tokio::test]
async fn non_concurrent_snapshot_reports_the_discovery_error() {
    let (daemon, base) = start_daemon().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/percy/snapshot"))
        .json(&json!({
            "name": "home",
            "url": "http://localhost:9/",
            "concurrent": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("browser launch failed"));
    daemon.stop().await;
}

#[tokio::test]
async fn idle_endpoint_resolves_on_an_empty_queue() {
    let (daemon, base) = start_daemon().await;
    let body: Value = reqwest::get(format!("{base}/percy/idle"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    daemon.stop().await;
}

#[tokio::test]
async fn stop_endpoint_succeeds_and_rejects_later_snapshots() {
    let (daemon, base) = start_daemon().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/percy/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    let err = daemon
        .snapshot(serde_json::from_value(json!({ "name": "late", "url": "http://localhost/" })).unwrap())
        .unwrap_err();
    assert!(matches!(err, percyd::Error::NotRunning));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (daemon, _base) = start_daemon().await;
    daemon.stop().await;
    daemon.stop().await;
}

#[tokio::test]
async fn stop_without_start_is_clean() {
    let api_url = start_stub_api().await;
    let daemon = PercyDaemon::new(test_config(api_url, free_port()), None).unwrap();
    daemon.stop().await;
    daemon.stop().await;
}

#[tokio::test]
async fn disabled_server_binds_nothing() {
    let api_url = start_stub_api().await;
    let port = free_port();
    let mut config = test_config(api_url, port);
    config.server = false;
    let daemon = PercyDaemon::new(config, None).unwrap();
    daemon.start().await.unwrap();

    let result = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/percy/healthcheck"))
        .send()
        .await;
    assert!(result.is_err(), "port {port} should refuse connections");
    daemon.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_and_keeps_the_build() {
    let (daemon, _base) = start_daemon().await;
    let first = daemon.build().unwrap();
    let again = daemon.start().await.unwrap();
    assert_eq!(first.id, again.id);
    daemon.stop().await;
}
