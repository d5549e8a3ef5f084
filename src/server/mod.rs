// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP surface over [`FleetService`]. Every route except `/health` needs a
//! bearer token; authorization is decided by the service per operation.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness and queue counters (unauthenticated)
//! - `/backends`, `/backends/:id` - Backend CRUD
//! - `/models`, `/models/:model` - Declared models
//! - `/pools`, `/pools/:id`, `/pool-by-name/:name`, `/pool-by-purpose/:purpose`
//! - `/backend-associations/...`, `/model-associations/...` - Pool membership
//! - `/access-control`, `/access-control/:id`, `/permissions`
//! - `/queue` - List (`GET`) or enqueue (`POST`) pulls
//! - `DELETE /queue/:model`, `DELETE /queue/jobs/:id` - Cancel
//! - `GET /queue/inProgress` - Server-sent progress events for every job
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use llmfleet::queue::JobQueue;
//! use llmfleet::server::{Server, TokenRegistry};
//! use llmfleet::service::FleetService;
//! use llmfleet::store::ResourceStore;
//! use llmfleet::stream::ProgressStreamer;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(ResourceStore::in_memory());
//! let queue = Arc::new(JobQueue::new(
//!     Arc::new(ProgressStreamer::default()),
//!     chrono::Duration::hours(1),
//! ));
//! let service = Arc::new(FleetService::new(store, queue));
//! let server = Server::new(service, TokenRegistry::new([("token", "root")])).with_port(8790);
//! server.start(Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;

pub use auth::{require_bearer, TokenRegistry};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::timeout::TimeoutLayer;

use crate::access::Permission;
use crate::associations::EdgeChange;
use crate::config::{RateLimitConfig, DEFAULT_BIND_ADDRESS, DEFAULT_PORT};
use crate::errors::ApiResult;
use crate::queue::{Enqueued, Job, PullRequest};
use crate::service::{Caller, FleetService, HealthReport};
use crate::store::EdgeKind;
use crate::stream::{ProgressEvent, Subscription};
use crate::types::{
    AccessEntry, AccessEntryPatch, AccessEntrySpec, Backend, BackendSpec, ExpandedAccessEntry, Model,
    Pool, PoolSpec,
};

// Maximum request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Default timeout for non-streaming requests (in seconds).
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared by every handler.
pub struct AppState {
    pub service: Arc<FleetService>,
    /// Ends open progress streams when the server shuts down.
    pub shutdown: CancellationToken,
}

type SharedState = Arc<AppState>;

/// API server configuration.
#[derive(Clone)]
pub struct Server {
    service: Arc<FleetService>,
    tokens: TokenRegistry,
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1).
    bind_address: String,
    request_timeout: Duration,
    rate_limit: Option<RateLimitConfig>,
}

impl Server {
    pub fn new(service: Arc<FleetService>, tokens: TokenRegistry) -> Self {
        Self {
            service,
            tokens,
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Timeout applied to every route except the progress streams.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build the router with all routes.
    pub fn build_router(&self, shutdown: CancellationToken) -> Router {
        let state = Arc::new(AppState {
            service: self.service.clone(),
            shutdown,
        });

        let api = Router::new()
            .route("/backends", get(list_backends).post(create_backend))
            .route(
                "/backends/:id",
                get(get_backend).put(update_backend).delete(delete_backend),
            )
            .route("/models", get(list_models).post(create_model))
            .route("/models/:model", delete(delete_model))
            .route("/pools", get(list_pools).post(create_pool))
            .route("/pools/:id", get(get_pool).put(update_pool).delete(delete_pool))
            .route("/pool-by-name/:name", get(get_pool_by_name))
            .route("/pool-by-purpose/:purpose", get(list_pools_by_purpose))
            .route("/backend-associations/:id/backends", get(backends_for_pool))
            .route(
                "/backend-associations/:id/backends/:member_id",
                post(assign_backend).delete(unassign_backend),
            )
            .route("/backend-associations/:id/pools", get(pools_for_backend))
            .route("/model-associations/:id/models", get(models_for_pool))
            .route(
                "/model-associations/:id/models/:member_id",
                post(assign_model).delete(unassign_model),
            )
            .route("/model-associations/:id/pools", get(pools_for_model))
            .route("/access-control", get(list_access).post(create_access))
            .route(
                "/access-control/:id",
                get(get_access).put(update_access).delete(delete_access),
            )
            .route("/permissions", get(list_permissions))
            .route("/queue", get(get_queue).post(enqueue))
            .route("/queue/:model", delete(cancel_model))
            .route("/queue/jobs/:id", get(get_job).delete(cancel_job))
            .layer(TimeoutLayer::new(self.request_timeout));

        let streaming = Router::new()
            .route("/queue/inProgress", get(progress_stream))
            .route("/queue/jobs/:id/stream", get(job_stream));

        let protected = api.merge(streaming).route_layer(middleware::from_fn_with_state(
            self.tokens.clone(),
            require_bearer,
        ));

        let router = Router::new()
            .route("/health", get(health))
            .merge(protected)
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

        let router = match &self.rate_limit {
            Some(limit) => {
                let governor_conf = GovernorConfigBuilder::default()
                    .per_second(limit.per_second)
                    .burst_size(limit.burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish();
                match governor_conf {
                    Some(config) => router.layer(GovernorLayer {
                        config: Arc::new(config),
                    }),
                    None => {
                        tracing::warn!("Invalid rate limit settings, serving without a rate limiter");
                        router
                    }
                }
            }
            None => router,
        };

        router.with_state(state)
    }

    /// Serve until SIGINT/SIGTERM or until `shutdown` is cancelled. Either
    /// way `shutdown` is cancelled on return so background loops stop too.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let router = self.build_router(shutdown.clone());
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another llmfleet instance may be running; \
                    stop it or pick a different port with: llmfleet serve --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        let graceful = {
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
            }
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .await?;

        shutdown.cancel();
        tracing::info!("Server stopped");
        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Deserialize)]
struct CreateModelRequest {
    model: String,
}

#[derive(Deserialize)]
struct AccessListQuery {
    identity: Option<String>,
    #[serde(default)]
    expand: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    download_queue: Vec<Job>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssociationResponse {
    pool_id: String,
    member_id: String,
    applied: bool,
}

#[derive(Serialize)]
struct PermissionsResponse {
    permissions: Vec<Permission>,
}

fn created<T: Serialize>(value: T) -> Response {
    (StatusCode::CREATED, Json(value)).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    Json(state.service.health())
}

async fn list_backends(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<Backend>> {
    Json(state.service.list_backends(&caller))
}

async fn create_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(spec): Json<BackendSpec>,
) -> ApiResult<Response> {
    Ok(created(state.service.create_backend(&caller, spec)?))
}

async fn get_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Backend>> {
    Ok(Json(state.service.get_backend(&caller, &id)?))
}

async fn update_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(spec): Json<BackendSpec>,
) -> ApiResult<Json<Backend>> {
    Ok(Json(state.service.update_backend(&caller, &id, spec)?))
}

async fn delete_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_backend(&caller, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_models(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<Model>> {
    Json(state.service.list_models(&caller))
}

async fn create_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<CreateModelRequest>,
) -> ApiResult<Response> {
    Ok(created(state.service.create_model(&caller, &request.model)?))
}

async fn delete_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(model): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_model(&caller, &model)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_pools(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<Pool>> {
    Json(state.service.list_pools(&caller))
}

async fn create_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(spec): Json<PoolSpec>,
) -> ApiResult<Response> {
    Ok(created(state.service.create_pool(&caller, spec)?))
}

async fn get_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Pool>> {
    Ok(Json(state.service.get_pool(&caller, &id)?))
}

async fn update_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(spec): Json<PoolSpec>,
) -> ApiResult<Json<Pool>> {
    Ok(Json(state.service.update_pool(&caller, &id, spec)?))
}

async fn delete_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_pool(&caller, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_pool_by_name(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> ApiResult<Json<Pool>> {
    Ok(Json(state.service.get_pool_by_name(&caller, &name)?))
}

async fn list_pools_by_purpose(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(purpose): Path<String>,
) -> Json<Vec<Pool>> {
    Json(state.service.list_pools_by_purpose(&caller, &purpose))
}

fn association_response(
    change: EdgeChange,
    pool_id: String,
    member_id: String,
    applied_status: StatusCode,
) -> Response {
    let applied = change == EdgeChange::Applied;
    let status = if applied { applied_status } else { StatusCode::OK };
    (
        status,
        Json(AssociationResponse {
            pool_id,
            member_id,
            applied,
        }),
    )
        .into_response()
}

fn assign_edge(state: &AppState, caller: &Caller, kind: EdgeKind, pool_id: String, member_id: String) -> ApiResult<Response> {
    let change = state.service.assign(caller, kind, &pool_id, &member_id)?;
    Ok(association_response(change, pool_id, member_id, StatusCode::CREATED))
}

fn unassign_edge(state: &AppState, caller: &Caller, kind: EdgeKind, pool_id: String, member_id: String) -> ApiResult<Response> {
    let change = state.service.unassign(caller, kind, &pool_id, &member_id)?;
    Ok(association_response(change, pool_id, member_id, StatusCode::OK))
}

async fn assign_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path((pool_id, backend_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    assign_edge(&state, &caller, EdgeKind::PoolBackend, pool_id, backend_id)
}

async fn unassign_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path((pool_id, backend_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    unassign_edge(&state, &caller, EdgeKind::PoolBackend, pool_id, backend_id)
}

async fn assign_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path((pool_id, model_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    assign_edge(&state, &caller, EdgeKind::PoolModel, pool_id, model_id)
}

async fn unassign_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path((pool_id, model_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    unassign_edge(&state, &caller, EdgeKind::PoolModel, pool_id, model_id)
}

async fn backends_for_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<Backend>>> {
    Ok(Json(state.service.list_backends_for_pool(&caller, &pool_id)?))
}

async fn models_for_pool(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<Model>>> {
    Ok(Json(state.service.list_models_for_pool(&caller, &pool_id)?))
}

async fn pools_for_backend(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(backend_id): Path<String>,
) -> ApiResult<Json<Vec<Pool>>> {
    Ok(Json(state.service.list_pools_for_member(
        &caller,
        EdgeKind::PoolBackend,
        &backend_id,
    )?))
}

async fn pools_for_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Vec<Pool>>> {
    Ok(Json(state.service.list_pools_for_member(
        &caller,
        EdgeKind::PoolModel,
        &model_id,
    )?))
}

async fn list_access(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<AccessListQuery>,
) -> ApiResult<Json<Vec<ExpandedAccessEntry>>> {
    Ok(Json(state.service.list_access_entries(
        &caller,
        query.identity.as_deref(),
        query.expand,
    )?))
}

async fn create_access(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(spec): Json<AccessEntrySpec>,
) -> ApiResult<Response> {
    Ok(created(state.service.create_access_entry(&caller, spec)?))
}

async fn get_access(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<AccessEntry>> {
    Ok(Json(state.service.get_access_entry(&caller, &id)?))
}

async fn update_access(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(patch): Json<AccessEntryPatch>,
) -> ApiResult<Json<AccessEntry>> {
    Ok(Json(state.service.update_access_entry(&caller, &id, patch)?))
}

async fn delete_access(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_access_entry(&caller, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_permissions(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<PermissionsResponse>> {
    Ok(Json(PermissionsResponse {
        permissions: state.service.permissions(&caller)?,
    }))
}

async fn get_queue(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<QueueResponse>> {
    Ok(Json(QueueResponse {
        download_queue: state.service.get_queue(&caller)?,
    }))
}

async fn enqueue(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<PullRequest>,
) -> ApiResult<Response> {
    Ok(match state.service.enqueue(&caller, request)? {
        Enqueued::Created(job) => created(job),
        Enqueued::Existing(job) => Json(job).into_response(),
    })
}

async fn get_job(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.service.get_job(&caller, &id)?))
}

async fn cancel_model(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(model): Path<String>,
) -> ApiResult<Json<QueueResponse>> {
    Ok(Json(QueueResponse {
        download_queue: state.service.cancel_model(&caller, &model)?,
    }))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.service.cancel_job(&caller, &id)?))
}

/// Progress events as unnamed SSE `data:` frames, ending at server shutdown.
fn sse_events(
    subscription: Subscription,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = subscription
        .into_stream()
        .take_until(shutdown.cancelled_owned())
        .map(|event: ProgressEvent| {
            let json = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().data(json))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn progress_stream(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.service.subscribe_progress(&caller)?;
    tracing::info!(caller = %caller.subject, "Progress stream opened");
    Ok(sse_events(subscription, state.shutdown.clone()))
}

async fn job_stream(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.service.subscribe_job(&caller, &id)?;
    Ok(sse_events(subscription, state.shutdown.clone()))
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::error!("Failed to install signal handlers, falling back to Ctrl+C");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
        Err(e) => {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
