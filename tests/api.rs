//! Build API client behavior against a scripted upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use percyd::api::{ApiClient, RetryConfig};
use percyd::Config;

/// Stub that fails `failures` times with the given status, then succeeds.
async fn flaky_api(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = (Arc::clone(&calls), failures, status);
    let app = Router::new()
        .route(
            "/builds",
            post(
                |State((calls, failures, status)): State<(Arc<AtomicUsize>, usize, StatusCode)>| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (
                            status,
                            Json(json!({ "errors": [{ "detail": "scripted failure" }] })),
                        )
                            .into_response()
                    } else {
                        Json(json!({
                            "data": {
                                "id": "build-9",
                                "attributes": { "build-number": 9, "web-url": "https://percy.local/9" }
                            }
                        }))
                        .into_response()
                    }
                },
            ),
        )
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://127.0.0.1:{port}"), calls)
}

fn config(api_url: String) -> Config {
    Config {
        token: "web_retry_test".to_string(),
        api_url,
        ..Config::default()
    }
}

#[tokio::test]
async fn server_errors_retry_until_success() {
    let (api_url, calls) = flaky_api(2, StatusCode::BAD_GATEWAY).await;
    let config = config(api_url);
    let client = ApiClient::new(&config)
        .unwrap()
        .with_retry(RetryConfig::instant());
    let build = client.create_build(&config).await.unwrap();
    assert_eq!(build.id, "build-9");
    assert_eq!(build.number, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (api_url, calls) = flaky_api(usize::MAX, StatusCode::INTERNAL_SERVER_ERROR).await;
    let config = config(api_url);
    let client = ApiClient::new(&config)
        .unwrap()
        .with_retry(RetryConfig::instant());
    let err = client.create_build(&config).await.unwrap_err();
    assert!(matches!(err, percyd::Error::Api { status: Some(500), .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let (api_url, calls) = flaky_api(usize::MAX, StatusCode::UNAUTHORIZED).await;
    let config = config(api_url);
    let client = ApiClient::new(&config)
        .unwrap()
        .with_retry(RetryConfig::instant());
    let err = client.create_build(&config).await.unwrap_err();
    match err {
        percyd::Error::Api { status, message } => {
            assert_eq!(status, Some(401));
            assert_eq!(message, "scripted failure");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
