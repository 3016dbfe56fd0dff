//! Local control server for SDK clients.
//!
//! Every handler answers JSON with a `success` flag; failures become 500s
//! with the error message so SDKs can surface them verbatim.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::daemon::PercyDaemon;
use crate::error::Result;
use crate::models::SnapshotOptions;

/// The bundled DOM-serialization script SDKs inject into the page under test.
pub const DOM_JS: &str = include_str!("../assets/dom.js");

/// A running control server. Dropping the handle leaves the server up;
/// `shutdown` stops accepting and lets in-flight requests finish.
pub struct ServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

impl ServerHandle {
    /// Signal graceful shutdown. Deliberately does not await the serve task:
    /// `stop()` is reachable from a handler, and joining here would deadlock
    /// on that handler's own connection.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn start(daemon: Arc<PercyDaemon>, port: u16) -> Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let port = listener.local_addr()?.port();
    let app = router(daemon);
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = rx.await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "control server error");
        }
    });
    Ok(ServerHandle {
        port,
        shutdown: Some(tx),
        _task: task,
    })
}

pub fn router(daemon: Arc<PercyDaemon>) -> Router {
    Router::new()
        .route("/percy/healthcheck", get(healthcheck))
        .route("/percy/dom.js", get(dom_js))
        .route("/percy/idle", get(idle))
        .route("/percy/snapshot", post(snapshot))
        .route("/percy/stop", post(stop))
        .fallback(not_found)
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(daemon)
}

async fn healthcheck(State(daemon): State<Arc<PercyDaemon>>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "loglevel": daemon.loglevel(),
        "config": serde_json::to_value(daemon.config()).unwrap_or_default(),
        "build": daemon.build(),
    }))
}

async fn dom_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        DOM_JS,
    )
}

async fn idle(State(daemon): State<Arc<PercyDaemon>>) -> Json<serde_json::Value> {
    daemon.idle().await;
    Json(json!({ "success": true }))
}

async fn snapshot(State(daemon): State<Arc<PercyDaemon>>, body: Bytes) -> Response {
    let payload: SnapshotOptions = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return error_response(format!("invalid snapshot payload: {e}")),
    };
    let concurrent = payload.concurrent;
    match daemon.snapshot(payload) {
        Err(e) => error_response(e.to_string()),
        Ok(_handle) if concurrent => Json(json!({ "success": true })).into_response(),
        Ok(handle) => match handle.wait().await {
            Ok(()) => Json(json!({ "success": true })).into_response(),
            Err(e) => error_response(e.to_string()),
        },
    }
}

async fn stop(State(daemon): State<Arc<PercyDaemon>>) -> Json<serde_json::Value> {
    daemon.stop().await;
    Json(json!({ "success": true }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "Not found" })),
    )
        .into_response()
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}
