//! In-process HTTP upstream for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Clone)]
pub struct Upstream {
    /// Requests served by `/fail`.
    pub fail_hits: Arc<AtomicUsize>,
    /// Number of upcoming `/flaky` requests that answer 503.
    pub flaky_failures: Arc<AtomicUsize>,
    /// Body served by `/payload`.
    pub payload: Arc<Mutex<Value>>,
}

async fn json_ok() -> Json<Value> {
    Json(json!({"status": "ok", "items": [1, 2, 3]}))
}

async fn text() -> &'static str {
    "hello from upstream"
}

async fn fail(State(up): State<Upstream>) -> StatusCode {
    up.fail_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn flaky(State(up): State<Upstream>) -> impl IntoResponse {
    let remaining = up.flaky_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        up.flaky_failures.fetch_sub(1, Ordering::SeqCst);
        (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response()
    } else {
        (StatusCode::OK, "recovered").into_response()
    }
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

async fn payload(State(up): State<Upstream>) -> Json<Value> {
    let body = up.payload.lock().map(|v| v.clone()).unwrap_or(Value::Null);
    Json(body)
}

async fn echo(headers: HeaderMap, body: String) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "body": body,
        "content_type": header("content-type"),
        "token": header("x-token"),
        "user_agent": header("user-agent"),
    }))
}

async fn redirect() -> Redirect {
    Redirect::to("/json")
}

/// Serve the test routes on an ephemeral port. Returns the base URL.
pub async fn spawn_upstream() -> (String, Upstream) {
    let upstream = Upstream {
        fail_hits: Arc::new(AtomicUsize::new(0)),
        flaky_failures: Arc::new(AtomicUsize::new(0)),
        payload: Arc::new(Mutex::new(json!({"version": 1}))),
    };

    let app = Router::new()
        .route("/json", get(json_ok))
        .route("/text", get(text))
        .route("/fail", any(fail))
        .route("/flaky", get(flaky))
        .route("/slow", get(slow))
        .route("/payload", get(payload))
        .route("/echo", any(echo))
        .route("/redirect", get(redirect))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}", addr), upstream)
}
