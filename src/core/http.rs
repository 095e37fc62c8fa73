//! Ops HTTP endpoints using Axum
//!
//! A thin layer over the module facade and the queue manager: health,
//! metrics, per-module stats/pause/resume, ad hoc enqueue and queue stats.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use crate::core::manager::QueueManager;
use crate::core::queue::Enqueued;
use crate::domains::WorkerModule;
use crate::error::QueueError;
use crate::jobs::{JobOptions, QueueStats};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<QueueManager>,
    pub modules: Arc<BTreeMap<String, Arc<dyn WorkerModule>>>,
    pub start_time: Arc<Instant>,
}

impl AppState {
    pub fn new(manager: Arc<QueueManager>, modules: &[Arc<dyn WorkerModule>]) -> Self {
        let modules = modules
            .iter()
            .map(|m| (m.name().to_string(), m.clone()))
            .collect();
        Self {
            manager,
            modules: Arc::new(modules),
            start_time: Arc::new(Instant::now()),
        }
    }

    fn module(&self, name: &str) -> Result<&Arc<dyn WorkerModule>, StatusCode> {
        self.modules.get(name).ok_or(StatusCode::NOT_FOUND)
    }
}

fn status_for(err: &QueueError) -> StatusCode {
    match err {
        QueueError::UnknownQueue(_) => StatusCode::NOT_FOUND,
        QueueError::InvalidCron { .. } => StatusCode::BAD_REQUEST,
        QueueError::ShuttingDown | QueueError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::InvalidState(_) => StatusCode::CONFLICT,
        QueueError::Broker(_) | QueueError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn log_error(context: &str) -> impl Fn(QueueError) -> StatusCode + '_ {
    move |e| {
        let status = status_for(&e);
        if status.is_server_error() {
            error!(error = %e, "{}", context);
        }
        status
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let modules: Vec<Value> = state
        .modules
        .values()
        .map(|m| {
            json!({
                "name": m.name(),
                "service": m.service(),
                "status": m.status(),
            })
        })
        .collect();
    let all_running = state.modules.values().all(|m| m.status().is_running());
    Json(json!({
        "status": if all_running { "healthy" } else { "degraded" },
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "service": "jobrelay-worker",
        "modules": modules,
    }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let metrics = state
        .manager
        .metrics()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Serialize)]
struct ModuleStatsResponse {
    module: String,
    status: crate::core::runtime::ModuleStatus,
    queues: Vec<QueueStats>,
}

async fn module_stats(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<Json<ModuleStatsResponse>, StatusCode> {
    let worker_module = state.module(&module)?;
    let queues = worker_module
        .get_queue_stats()
        .await
        .map_err(log_error("Failed to load module stats"))?;
    Ok(Json(ModuleStatsResponse {
        module,
        status: worker_module.status(),
        queues,
    }))
}

async fn pause_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .module(&module)?
        .pause_all_queues()
        .await
        .map_err(log_error("Failed to pause module"))?;
    info!(module = %module, "Paused all queues of {}", module);
    Ok(Json(json!({ "module": module, "paused": true })))
}

async fn resume_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .module(&module)?
        .resume_all_queues()
        .await
        .map_err(log_error("Failed to resume module"))?;
    info!(module = %module, "Resumed all queues of {}", module);
    Ok(Json(json!({ "module": module, "paused": false })))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    name: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    options: JobOptions,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let handle = state
        .manager
        .get_queue(&queue)
        .map_err(log_error("Failed to resolve queue"))?;
    let enqueued = handle
        .add(&request.name, request.payload, request.options)
        .await
        .map_err(log_error("Failed to enqueue job"))?;

    let body = match enqueued {
        Enqueued::Job(job) => json!({
            "jobId": job.id,
            "queue": job.queue_name,
            "state": job.state,
        }),
        Enqueued::Recurring { key, created } => json!({
            "key": key,
            "created": created,
        }),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<QueueStats>, StatusCode> {
    let stats = state
        .manager
        .get_queue_stats(&queue)
        .await
        .map_err(log_error("Failed to load queue stats"))?;
    Ok(Json(stats))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/modules/{module}/stats", get(module_stats))
        .route("/api/modules/{module}/pause", post(pause_module))
        .route("/api/modules/{module}/resume", post(resume_module))
        .route("/api/queues/{queue}/jobs", post(enqueue_job))
        .route("/api/queues/{queue}/stats", get(queue_stats))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve the ops router until `shutdown` resolves
pub async fn start_server(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port = port, "Ops server listening on port {}", port);
    info!("Metrics endpoint available at http://0.0.0.0:{}/metrics", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
