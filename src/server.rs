//! HTTP surface.
//!
//! Four routes:
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/webhook` | POST | Signed project update ingestion |
//! | `/health` | GET | Liveness probe |
//! | `/rollup/trigger` | POST | Manual rollup run (same guard as the scheduler) |
//! | `/check/{database_id}` | GET | Database reachability probe |
//!
//! The webhook route reads the raw body bytes before any JSON parsing, since
//! the signature covers the exact bytes on the wire.

use crate::handler::{EventHandler, HandlerResult};
use crate::linear::TeamDirectory;
use crate::notion::Workspace;
use crate::rollup::{JobOutcome, RollupRunner};
use crate::{Error, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Header carrying the webhook signature.
const SIGNATURE_HEADER: &str = "linear-signature";

/// Shared state handed to every route handler.
pub struct AppState<D, W> {
    /// Webhook event handler.
    pub handler: Arc<EventHandler<D, W>>,
    /// Rollup runner shared with the scheduler.
    pub runner: Arc<RollupRunner<W>>,
    /// Workspace client, used directly by the reachability probe.
    pub workspace: Arc<W>,
}

impl<D, W> Clone for AppState<D, W> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            runner: Arc::clone(&self.runner),
            workspace: Arc::clone(&self.workspace),
        }
    }
}

/// Builds the application router.
pub fn router<D, W>(state: AppState<D, W>) -> Router
where
    D: TeamDirectory + 'static,
    W: Workspace + 'static,
{
    Router::new()
        .route("/webhook", post(webhook::<D, W>))
        .route("/health", get(health))
        .route("/rollup/trigger", post(trigger_rollup::<D, W>))
        .route("/check/{database_id}", get(check_database::<D, W>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves until the shutdown signal flips.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] when the port cannot be bound or the
/// server loop fails.
pub async fn serve<D, W>(
    state: AppState<D, W>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    D: TeamDirectory + 'static,
    W: Workspace + 'static,
{
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "bind".to_string(),
            cause: format!("port {port}: {e}"),
        })?;
    tracing::info!(port, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            // Keep serving until the flag flips to true or the sender side
            // goes away.
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "serve".to_string(),
            cause: e.to_string(),
        })
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn webhook<D, W>(
    State(state): State<AppState<D, W>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    D: TeamDirectory + 'static,
    W: Workspace + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.handler.handle(&body, signature).await {
        HandlerResult::Success => {
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        },
        HandlerResult::Ignored => {
            (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response()
        },
        HandlerResult::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        )
            .into_response(),
        HandlerResult::Failed(message) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": message })),
        )
            .into_response(),
    }
}

async fn trigger_rollup<D, W>(State(state): State<AppState<D, W>>) -> Response
where
    D: TeamDirectory + 'static,
    W: Workspace + 'static,
{
    let outcome = state.runner.run(chrono::Utc::now()).await;
    let status = match &outcome {
        JobOutcome::Succeeded { .. } => StatusCode::ACCEPTED,
        JobOutcome::Skipped => StatusCode::OK,
        JobOutcome::AlreadyRunning => StatusCode::CONFLICT,
        JobOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome)).into_response()
}

async fn check_database<D, W>(
    State(state): State<AppState<D, W>>,
    Path(database_id): Path<String>,
) -> Response
where
    D: TeamDirectory + 'static,
    W: Workspace + 'static,
{
    match state.workspace.database_reachable(&database_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "reachable", "database_id": database_id })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string(), "database_id": database_id })),
        )
            .into_response(),
    }
}
