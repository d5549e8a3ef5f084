// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Router-level tests: requests go through authentication, authorization,
//! handlers and error rendering without opening a socket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use llmfleet::queue::JobQueue;
use llmfleet::{
    BackendProbe, FleetResult, FleetService, ProgressStreamer, Reconciler, ResourceStore, Server,
    TokenRegistry,
};

const ROOT_TOKEN: &str = "root-token";
const BOB_TOKEN: &str = "bob-token";

struct NoProbe;

#[async_trait]
impl BackendProbe for NoProbe {
    async fn hosted_models(&self, _base_url: &str) -> FleetResult<Vec<String>> {
        Ok(Vec::new())
    }
}

fn router() -> Router {
    let store = Arc::new(ResourceStore::in_memory());
    let queue = Arc::new(JobQueue::new(
        Arc::new(ProgressStreamer::default()),
        chrono::Duration::hours(1),
    ));
    let reconciler = Reconciler::new(store.clone(), queue.clone(), Arc::new(NoProbe));
    let service = FleetService::new(store, queue).with_reconciler(reconciler);
    service.access().seed_admin("root").expect("seed admin");

    let tokens = TokenRegistry::new([(ROOT_TOKEN, "root"), (BOB_TOKEN, "bob")]);
    Server::new(Arc::new(service), tokens).build_router(CancellationToken::new())
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap())),
        None => request.body(Body::empty()),
    }
    .expect("request should build");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("request should succeed");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .expect("body reading should succeed");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body should be JSON")
    };
    (status, value)
}

async fn root(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send(router, method, uri, Some(ROOT_TOKEN), body).await
}

/// Pool "chat" with backend "gpu" and model "llama" assigned to it.
async fn seeded_pool(router: &Router) -> (String, String, String) {
    let (status, pool) = root(router, "POST", "/pools", Some(json!({"name": "chat", "purposeType": "chat"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, backend) = root(
        router,
        "POST",
        "/backends",
        Some(json!({"name": "gpu", "baseUrl": "http://gpu:11434", "type": "ollama"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, model) = root(router, "POST", "/models", Some(json!({"model": "llama"}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let pool_id = pool["id"].as_str().unwrap().to_string();
    let backend_id = backend["id"].as_str().unwrap().to_string();
    let model_id = model["id"].as_str().unwrap().to_string();

    let (status, _) = root(router, "POST", &format!("/model-associations/{}/models/{}", pool_id, model_id), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = root(router, "POST", &format!("/backend-associations/{}/backends/{}", pool_id, backend_id), None).await;
    assert_eq!(status, StatusCode::CREATED);

    (pool_id, backend_id, model_id)
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_health_needs_no_token() {
    let router = router();
    let (status, body) = send(&router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeJobs"], 0);
}

#[tokio::test]
async fn test_missing_or_unknown_token_is_401() {
    let router = router();
    let (status, body) = send(&router, "GET", "/pools", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["error_type"], "authentication_required");

    let (status, _) = send(&router, "GET", "/pools", Some("wrong-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Resources and associations
// =============================================================================

#[tokio::test]
async fn test_pool_lifecycle_and_lookups() {
    let router = router();
    let (pool_id, backend_id, model_id) = seeded_pool(&router).await;

    let (status, pool) = root(&router, "GET", "/pool-by-name/chat", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool["id"], pool_id.as_str());

    let (_, pools) = root(&router, "GET", "/pool-by-purpose/chat", None).await;
    assert_eq!(pools.as_array().unwrap().len(), 1);

    let (_, backends) = root(&router, "GET", &format!("/backend-associations/{}/backends", pool_id), None).await;
    assert_eq!(backends[0]["id"], backend_id.as_str());
    let (_, pools) = root(&router, "GET", &format!("/model-associations/{}/pools", model_id), None).await;
    assert_eq!(pools[0]["id"], pool_id.as_str());

    // Duplicate create is a conflict.
    let (status, body) = root(&router, "POST", "/pools", Some(json!({"name": "chat", "purposeType": "x"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["error_type"], "conflict");

    // Deleting the pool cascades its edges.
    let (status, _) = root(&router, "DELETE", &format!("/pools/{}", pool_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, pools) = root(&router, "GET", &format!("/backend-associations/{}/pools", backend_id), None).await;
    assert_eq!(pools, json!([]));
    let (status, _) = root(&router, "GET", &format!("/pools/{}", pool_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_assign_is_idempotent_and_checks_endpoints() {
    let router = router();
    let (pool_id, backend_id, _) = seeded_pool(&router).await;

    let uri = format!("/backend-associations/{}/backends/{}", pool_id, backend_id);
    let (status, body) = root(&router, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);

    let (status, _) = root(&router, "POST", &format!("/backend-associations/{}/backends/ghost", pool_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = root(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    let (_, body) = root(&router, "DELETE", &uri, None).await;
    assert_eq!(body["applied"], false);
}

#[tokio::test]
async fn test_invalid_backend_url_is_400() {
    let router = router();
    let (status, body) = root(
        &router,
        "POST",
        "/backends",
        Some(json!({"name": "gpu", "baseUrl": "gpu:11434", "type": "ollama"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["error_type"], "invalid_request");
}

// =============================================================================
// Access control
// =============================================================================

#[tokio::test]
async fn test_grant_then_revoke_read_on_pool() {
    let router = router();
    let (pool_id, _, _) = seeded_pool(&router).await;
    let pool_uri = format!("/pools/{}", pool_id);

    let (status, _) = send(&router, "GET", &pool_uri, Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, pools) = send(&router, "GET", "/pools", Some(BOB_TOKEN), None).await;
    assert_eq!(pools, json!([]));

    let (status, entry) = root(
        &router,
        "POST",
        "/access-control",
        Some(json!({"identity": "bob", "resource": format!("pools/{}", pool_id), "permission": "read"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let entry_id = entry["id"].as_str().unwrap().to_string();

    let (status, _) = send(&router, "GET", &pool_uri, Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&router, "DELETE", &pool_uri, Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, listed) = root(&router, "GET", "/access-control?identity=bob&expand=true", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = root(&router, "DELETE", &format!("/access-control/{}", entry_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, "GET", &pool_uri, Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_access_entries_need_manage() {
    let router = router();
    let (status, _) = send(
        &router,
        "POST",
        "/access-control",
        Some(BOB_TOKEN),
        Some(json!({"identity": "bob", "resource": "*", "permission": "any"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = root(&router, "GET", "/permissions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["permissions"], json!(["read", "write", "manage", "any"]));
}

// =============================================================================
// Queue
// =============================================================================

#[tokio::test]
async fn test_assignment_queues_missing_model_and_cancel_by_model() {
    let router = router();
    seeded_pool(&router).await;

    let (status, body) = root(&router, "GET", "/queue", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["downloadQueue"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["task"]["model"], "llama");
    assert_eq!(jobs[0]["task"]["type"], "modelPull");
    assert_eq!(jobs[0]["phase"], "queued");

    let (status, body) = root(&router, "DELETE", "/queue/llama", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["downloadQueue"].as_array().unwrap().len(), 1);

    let (status, _) = root(&router, "DELETE", "/queue/llama", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = root(&router, "GET", "/queue", None).await;
    assert_eq!(body["downloadQueue"], json!([]));
}

#[tokio::test]
async fn test_enqueue_dedup_window_validation_and_cancel_by_id() {
    let router = router();
    seeded_pool(&router).await;

    let (status, job) = root(
        &router,
        "POST",
        "/queue",
        Some(json!({"model": "mistral", "baseUrl": "http://gpu:11434"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, again) = root(
        &router,
        "POST",
        "/queue",
        Some(json!({"model": "mistral", "baseUrl": "http://gpu:11434"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], job["id"]);

    let (status, _) = root(
        &router,
        "POST",
        "/queue",
        Some(json!({
            "model": "phi",
            "baseUrl": "http://gpu:11434",
            "scheduledFor": 2_000_000_000,
            "validUntil": 1_900_000_000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let job_uri = format!("/queue/jobs/{}", job["id"].as_str().unwrap());
    let (status, removed) = root(&router, "DELETE", &job_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["phase"], "removed");
    let (status, _) = root(&router, "DELETE", &job_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_requires_read() {
    let router = router();
    let (status, _) = send(&router, "GET", "/queue", Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&router, "GET", "/queue/inProgress", Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_progress_stream_sends_unnamed_data_frames() {
    let router = router();
    let (status, _) = root(
        &router,
        "POST",
        "/backends",
        Some(json!({"name": "gpu", "baseUrl": "http://gpu:11434", "type": "ollama"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let request = Request::builder()
        .method("GET")
        .uri("/queue/inProgress")
        .header(header::AUTHORIZATION, format!("Bearer {}", ROOT_TOKEN))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // Far enough ahead that nothing dispatches it before the cancel.
    let scheduled_for = chrono::Utc::now().timestamp() + 3600;
    let (status, job) = root(
        &router,
        "POST",
        "/queue",
        Some(json!({
            "model": "mistral",
            "baseUrl": "http://gpu:11434",
            "scheduledFor": scheduled_for,
            "validUntil": scheduled_for + 3600
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let job_uri = format!("/queue/jobs/{}", job["id"].as_str().unwrap());
    let (status, _) = root(&router, "DELETE", &job_uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let mut text = String::new();
        while !text.contains("\n\n") {
            let chunk = body.next().await.expect("stream ended early").expect("chunk");
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        text
    })
    .await
    .expect("no frame within timeout");

    assert!(frame.starts_with("data: "), "unexpected frame: {:?}", frame);
    assert!(!frame.contains("event:"));
    let payload: Value = serde_json::from_str(frame["data: ".len()..].trim_end()).unwrap();
    assert_eq!(payload["jobId"], job["id"]);
    assert_eq!(payload["model"], "mistral");
    assert_eq!(payload["status"], "removed");
}
