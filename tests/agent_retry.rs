//! Integration tests for the agent executor retry loop and health probes.
//! Spins up in-process axum mocks on random ports and drives real HTTP.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use incorp::agent::{codes, AgentExecutor, HealthStatus, RequestOptions, RetryPolicy};

#[derive(Debug, Deserialize)]
struct Pong {
    ok: bool,
}

/// Serve `router` on a random loopback port; returns the base URL.
async fn spawn_mock(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn executor(base_url: &str, policy: RetryPolicy) -> AgentExecutor {
    AgentExecutor::new("mock", base_url, None, Some(Duration::from_secs(5)), policy).unwrap()
}

/// Handler that fails with 503 until `fail_first` hits have been consumed.
fn flaky_router(hits: Arc<AtomicU32>, fail_first: u32) -> Router {
    Router::new().route(
        "/ping",
        post(move |State(hits): State<Arc<AtomicU32>>| async move {
            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= fail_first {
                (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})))
            } else {
                (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
            }
        })
        .with_state(hits),
    )
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_mock(flaky_router(Arc::clone(&hits), 2)).await;

    let exec = executor(&base, RetryPolicy::instant());
    let pong: Pong = exec
        .post("/ping", &serde_json::json!({}), RequestOptions::default())
        .await
        .unwrap();

    assert!(pong.ok);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_short_circuit_without_retry() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new().route(
        "/ping",
        post(move |State(hits): State<Arc<AtomicU32>>| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "reason": "malformed" })),
            )
        })
        .with_state(Arc::clone(&hits)),
    );
    let base = spawn_mock(router).await;

    let exec = executor(&base, RetryPolicy::instant());
    let err = exec
        .post::<Pong, _>("/ping", &serde_json::json!({}), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, "HTTP_400");
    assert!(!err.retryable);
    assert_eq!(err.http_status, Some(400));
    // Error body is surfaced as structured details.
    assert_eq!(err.details.unwrap()["reason"], "malformed");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_failure_exhausts_all_attempts() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_mock(flaky_router(Arc::clone(&hits), u32::MAX)).await;

    let exec = executor(&base, RetryPolicy::instant());
    let err = exec
        .post::<Pong, _>("/ping", &serde_json::json!({}), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, "HTTP_503");
    assert!(err.retryable);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn idempotency_key_is_identical_on_every_attempt() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let hits = Arc::new(AtomicU32::new(0));
    let hits_in_handler = Arc::clone(&hits);
    let router = Router::new().route(
        "/ping",
        post(move |headers: HeaderMap| {
            let seen = Arc::clone(&seen_in_handler);
            let hits = Arc::clone(&hits_in_handler);
            async move {
                if let Some(key) = headers.get("Idempotency-Key") {
                    seen.lock().unwrap().push(key.to_str().unwrap().to_string());
                }
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})))
                } else {
                    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
                }
            }
        }),
    );
    let base = spawn_mock(router).await;

    let exec = executor(&base, RetryPolicy::instant());
    let opts = RequestOptions::with_idempotency_key("charge-abc123");
    let _: Pong = exec
        .post("/ping", &serde_json::json!({}), opts)
        .await
        .unwrap();

    let keys = seen.lock().unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| k == "charge-abc123"));
}

#[tokio::test]
async fn skip_retry_makes_exactly_one_attempt() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_mock(flaky_router(Arc::clone(&hits), u32::MAX)).await;

    let exec = executor(&base, RetryPolicy::instant());
    let err = exec
        .post::<Pong, _>("/ping", &serde_json::json!({}), RequestOptions::no_retry())
        .await
        .unwrap_err();

    assert!(err.retryable);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_before_start_never_hits_the_wire() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_mock(flaky_router(Arc::clone(&hits), 0)).await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();

    let exec = executor(&base, RetryPolicy::instant());
    let opts = RequestOptions {
        cancel: Some(rx),
        ..RequestOptions::default()
    };
    let err = exec
        .post::<Pong, _>("/ping", &serde_json::json!({}), opts)
        .await
        .unwrap_err();

    assert_eq!(err.code, codes::CANCELLED);
    assert!(!err.retryable);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_success_body_is_invalid_response() {
    let router = Router::new().route(
        "/ping",
        post(|| async { (StatusCode::OK, "this is not json") }),
    );
    let base = spawn_mock(router).await;

    let exec = executor(&base, RetryPolicy::instant());
    let err = exec
        .post::<Pong, _>("/ping", &serde_json::json!({}), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code, codes::INVALID_RESPONSE);
    assert!(!err.retryable);
}

#[tokio::test]
async fn health_probe_reports_online_with_latency() {
    let router = Router::new().route("/health", get(|| async { Json(serde_json::json!({})) }));
    let base = spawn_mock(router).await;

    let exec = executor(&base, RetryPolicy::no_retry());
    let health = exec.check_health().await;

    assert_eq!(health.status, HealthStatus::Online);
    assert!(health.latency_ms.is_some());
    assert!(health.last_success_at.is_some());
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn health_probe_failure_keeps_last_success_timestamp() {
    let router = Router::new().route("/health", get(|| async { Json(serde_json::json!({})) }));
    let base = spawn_mock(router).await;

    let exec = executor(&base, RetryPolicy::no_retry());
    let first = exec.check_health().await;
    assert_eq!(first.status, HealthStatus::Online);
    let success_at = first.last_success_at.unwrap();

    // Re-point the probe at a dead port by building a fresh executor sharing
    // nothing, then check the stateful path on the original: simulate the
    // agent going away by probing a port nothing listens on.
    let dead = executor("http://127.0.0.1:1", RetryPolicy::no_retry());
    let down = dead.check_health().await;
    assert_eq!(down.status, HealthStatus::Offline);
    assert_eq!(down.consecutive_failures, 1);
    assert!(down.latency_ms.is_none());

    // The original executor's recorded success is untouched.
    let snapshot = exec.health().await;
    assert_eq!(snapshot.last_success_at, Some(success_at));
}

#[tokio::test]
async fn consecutive_failures_accumulate() {
    let exec = executor("http://127.0.0.1:1", RetryPolicy::no_retry());
    exec.check_health().await;
    exec.check_health().await;
    let health = exec.check_health().await;

    assert_eq!(health.status, HealthStatus::Offline);
    assert_eq!(health.consecutive_failures, 3);
}

#[tokio::test]
async fn connection_refused_is_retryable_network_error() {
    let exec = executor("http://127.0.0.1:1", RetryPolicy::instant());
    let err = exec
        .get::<Pong>("/ping", RequestOptions::no_retry())
        .await
        .unwrap_err();

    assert_eq!(err.code, codes::NETWORK_ERROR);
    assert!(err.retryable);
}
