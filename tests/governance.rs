use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use governance_gateway::{
    AppState,
    cache::RedisHandle,
    config::Config,
    governance::{GovernanceService, ProviderLimit},
    router::{create_router, governed},
};
use serde_json::{Value, json};
use tower::ServiceExt;

const KEY: &str = "3f1c9a7e-5b2d-4c8e-9f6a-1d2e3f4a5b6c";

async fn create_order(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::CREATED, Json(json!({ "id": n })))
}

async fn failing_order(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "downstream exploded" })),
    )
}

async fn slow_order(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::CREATED, Json(json!({ "id": n })))
}

async fn export_orders(State(calls): State<Arc<AtomicUsize>>) -> String {
    calls.fetch_add(1, Ordering::SeqCst);
    "x".repeat(200)
}

async fn list_orders(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    calls.fetch_add(1, Ordering::SeqCst);
    Json(json!([]))
}

fn app(service: Arc<GovernanceService>, calls: Arc<AtomicUsize>) -> Router {
    governed(
        Router::new()
            .route("/orders", post(create_order).get(list_orders))
            .route("/orders/failing", post(failing_order))
            .route("/orders/slow", post(slow_order))
            .route("/orders/export", post(export_orders)),
        service,
    )
    .with_state(calls)
}

fn groq_config() -> Config {
    Config {
        provider_limits: vec![ProviderLimit::tokens("groq", 30_000)],
        ..Config::default()
    }
}

fn post_request(uri: &str, key: Option<&str>, tokens: Option<u64>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-ai-provider", "groq");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    if let Some(tokens) = tokens {
        builder = builder.header("x-estimated-tokens", tokens.to_string());
    }
    builder
        .body(Body::from(r#"{"model":"llama-3.1-8b-instant"}"#))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn replays_cached_response_without_invoking_handler() {
    let service = Arc::new(GovernanceService::with_backends(&Config::default(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    let first = app
        .clone()
        .oneshot(post_request("/orders", Some(KEY), None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(body_json(first).await, json!({ "id": 1 }));

    let second = app
        .oneshot(post_request("/orders", Some(KEY), None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(
        second.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(body_json(second).await, json!({ "id": 1 }));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let counters = service.metrics().snapshot();
    assert_eq!(counters.cached, 1);
    assert_eq!(counters.replayed, 1);
}

#[tokio::test]
async fn missing_or_malformed_key_is_rejected() {
    let service = Arc::new(GovernanceService::with_backends(&Config::default(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    let missing = app
        .clone()
        .oneshot(post_request("/orders", None, None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(missing).await["code"], "IDEMPOTENCY_KEY_REQUIRED");

    let malformed = app
        .oneshot(post_request("/orders", Some("not-a-uuid"), None))
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(malformed).await["code"], "INVALID_IDEMPOTENCY_KEY");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn safe_methods_pass_through_without_key() {
    let service = Arc::new(GovernanceService::with_backends(&Config::default(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(Request::get("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn error_responses_are_cached_too() {
    let service = Arc::new(GovernanceService::with_backends(&Config::default(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_request("/orders/failing", Some(KEY), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "downstream exploded" })
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejects_over_budget_request_when_queueing_disabled() {
    let config = Config {
        queue_enabled: false,
        ..groq_config()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    let keys = [
        "0b6f1c2d-3e4f-4a5b-8c6d-7e8f9a0b1c2d",
        "1c7a2d3e-4f5a-4b6c-9d7e-8f9a0b1c2d3e",
        "2d8b3e4f-5a6b-4c7d-ae8f-9a0b1c2d3e4f",
    ];
    for key in &keys[..2] {
        let response = app
            .clone()
            .oneshot(post_request("/orders", Some(key), Some(12_000)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let rejected = app
        .oneshot(post_request("/orders", Some(keys[2]), Some(12_000)))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()[header::RETRY_AFTER], "60");

    let body = body_json(rejected).await;
    assert_eq!(body["code"], "TPM_LIMIT_EXCEEDED");
    assert_eq!(body["provider"], "groq");
    assert_eq!(body["limit"], 30_000);
    assert_eq!(body["retryAfter"], 60);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn replay_does_not_consume_token_budget() {
    let config = Config {
        queue_enabled: false,
        ..groq_config()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(post_request("/orders", Some(KEY), Some(20_000)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queued_request_resumes_once_window_frees() {
    let config = Config {
        tpm_window_secs: 1,
        queue_drain_interval_ms: 50,
        ..groq_config()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let _workers = service.spawn_workers();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    let keys = [
        "4f0d5a6b-7c8d-4e9f-8a0b-1c2d3e4f5a6b",
        "5a1e6b7c-8d9e-4f0a-9b1c-2d3e4f5a6b7c",
        "6b2f7c8d-9e0f-4a1b-ac2d-3e4f5a6b7c8d",
    ];
    for key in &keys[..2] {
        let response = app
            .clone()
            .oneshot(post_request("/orders", Some(key), Some(12_000)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let queued = tokio::time::timeout(
        Duration::from_secs(5),
        app.oneshot(post_request("/orders", Some(keys[2]), Some(12_000))),
    )
    .await
    .expect("resumed after the window decayed")
    .unwrap();

    assert_eq!(queued.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(service.metrics().snapshot().queued, 1);
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let config = Config {
        queue_max_size: 0,
        ..groq_config()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls);

    let first = app
        .clone()
        .oneshot(post_request(
            "/orders",
            Some("7c3a8d9e-0f1a-4b2c-8d3e-4f5a6b7c8d9e"),
            Some(30_000),
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let rejected = tokio::time::timeout(
        Duration::from_millis(500),
        app.oneshot(post_request(
            "/orders",
            Some("8d4b9e0f-1a2b-4c3d-9e4f-5a6b7c8d9e0f"),
            Some(1),
        )),
    )
    .await
    .expect("rejected without waiting")
    .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn unreachable_redis_falls_back_to_in_process_backends() {
    // 本机 1 号端口无服务，连接会被立即拒绝
    let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
    let handle = RedisHandle::new(client, Duration::from_millis(200));
    let service = Arc::new(GovernanceService::new(&groq_config(), Some(handle)));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_request("/orders", Some(KEY), Some(1_000)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await, json!({ "id": 1 }));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = service.stats().await;
    assert!(stats.distributed_backend);
    assert!(stats.backend_fallbacks > 0);
    assert_eq!(stats.providers[0].current_tokens, 1_000);
}

#[tokio::test]
async fn exposes_health_and_stats() {
    let config = groq_config();
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let app = create_router(AppState::new(config, service));

    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await, json!({ "status": "ok" }));

    let stats = app
        .oneshot(Request::get("/governance/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    let body = body_json(stats).await;
    assert_eq!(body["windowSecs"], 60);
    assert_eq!(body["providers"][0]["name"], "groq");
    assert_eq!(body["providers"][0]["tokensPerMinute"], 30_000);
    assert_eq!(body["providers"][0]["queueState"], "empty");
}

#[tokio::test]
async fn chat_proxy_requires_idempotency_key() {
    let config = Config::default();
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let app = create_router(AppState::new(config, service));

    let response = app
        .oneshot(
            Request::post("/api/ai/chat")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejected_key_can_be_retried_once_budget_frees() {
    let config = Config {
        provider_limits: vec![ProviderLimit::tokens("groq", 100)],
        tpm_window_secs: 1,
        queue_enabled: false,
        ..Config::default()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    let spent = app
        .clone()
        .oneshot(post_request(
            "/orders",
            Some("9e5c0f1a-2b3c-4d4e-8f5a-6b7c8d9e0f1a"),
            Some(100),
        ))
        .await
        .unwrap();
    assert_eq!(spent.status(), StatusCode::CREATED);

    let rejected = app
        .clone()
        .oneshot(post_request("/orders", Some(KEY), Some(50)))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()[header::RETRY_AFTER], "1");

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let retried = app
        .oneshot(post_request("/orders", Some(KEY), Some(50)))
        .await
        .unwrap();
    assert_eq!(retried.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.metrics().snapshot().cached, 2);
}

#[tokio::test]
async fn absurd_max_tokens_is_rejected_not_wrapped() {
    let service = Arc::new(GovernanceService::with_backends(&groq_config(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service, calls.clone());

    let request = Request::post("/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .header("idempotency-key", KEY)
        .body(Body::from(
            r#"{"model":"llama-3.1-8b-instant","max_tokens":18446744073709551615}"#,
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["code"], "TPM_LIMIT_EXCEEDED");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_response_passes_through_uncached() {
    let config = Config {
        max_body_bytes: 64,
        ..Config::default()
    };
    let service = Arc::new(GovernanceService::with_backends(&config, None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_request("/orders/export", Some(KEY), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 200);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.metrics().snapshot().cached, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_share_one_invocation() {
    let service = Arc::new(GovernanceService::with_backends(&Config::default(), None, None));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(service.clone(), calls.clone());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let response = app
                .oneshot(post_request("/orders/slow", Some(KEY), None))
                .await
                .unwrap();
            (response.status(), body_json(response).await)
        }));
    }

    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({ "id": 1 }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.metrics().snapshot().replayed, 7);
    assert!(service.key_locks().is_empty());
}
