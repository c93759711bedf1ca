//! HTTP surface for chat and worker control.
//!
//! The chat route fronts the fast responder; the worker routes let an
//! external scheduler (or an operator) drive the queue and inspect it.
//! Worker routes check the shared secret whenever one is configured and
//! refuse everything outside development when it is not.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, ServerConfig};
use crate::fast::{ChatRequest, FastResponder};
use crate::jobs::{BatchOptions, BatchProcessor};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub responder: Arc<FastResponder>,
    pub processor: Arc<BatchProcessor>,
    pub db: Arc<dyn Database>,
    pub server: ServerConfig,
    pub queue: QueueConfig,
}

/// Build the Axum router with chat and worker routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/worker/run", post(run_worker))
        .route("/api/worker/stats", get(worker_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fast-talk"
    }))
}

// ── Chat ────────────────────────────────────────────────────────────────

async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Message must not be empty"})),
        );
    }

    match state.responder.respond(body).await {
        Ok(reply) => (StatusCode::OK, Json(serde_json::json!(reply))),
        Err(e) => {
            error!("Chat request failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────

/// Manual worker trigger. Every field is optional; omitted ones fall
/// back to queue configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkerRequest {
    #[serde(default)]
    pub types: Vec<String>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
}

/// A configured secret is always enforced; a missing one is only
/// tolerated in development.
fn authorize_worker(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match (&state.server.worker_secret, token) {
        (Some(secret), Some(token)) if token == secret.expose_secret() => Ok(()),
        (None, _) if state.server.environment.is_development() => {
            warn!("Worker route called without a configured secret; allowed in development");
            Ok(())
        }
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid or missing worker token"})),
        )),
    }
}

async fn run_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RunWorkerRequest>>,
) -> impl IntoResponse {
    if let Err(denied) = authorize_worker(&state, &headers) {
        return denied;
    }
    let body = body.map(|Json(body)| body).unwrap_or_default();

    let options = BatchOptions {
        worker_id: format!("http-{}", Uuid::new_v4()),
        types: body.types,
        batch_size: body.batch_size.unwrap_or(state.queue.batch_size),
        concurrency: body.concurrency.unwrap_or(state.queue.concurrency),
    };

    match state.processor.process_batch(&options).await {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "processed": result.processed,
                "succeeded": result.succeeded,
                "failed": result.failed,
                "jobs": result.jobs,
            })),
        ),
        Err(e) => {
            error!("Worker batch failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn worker_stats(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = authorize_worker(&state, &headers) {
        return denied;
    }

    let sweep = match state
        .db
        .cleanup_stale_jobs(state.queue.stale_threshold, state.queue.max_attempts)
        .await
    {
        Ok(sweep) => sweep,
        Err(e) => {
            error!("Stale sweep failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };

    match state.db.queue_stats(state.queue.stale_threshold).await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({"queue": stats, "sweep": sweep})),
        ),
        Err(e) => {
            error!("Queue stats failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
