// HTTP routes + SSE progress stream

mod http;
mod sse;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

use crate::execution_repo::ExecutionRepo;
use crate::models::ProgressEvent;
use crate::selfupdate::SelfUpdater;
use crate::worker::UpdateJob;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) repo: Arc<ExecutionRepo>,
    pub(crate) job_tx: mpsc::Sender<UpdateJob>,
    pub(crate) progress_tx: broadcast::Sender<ProgressEvent>,
    pub(crate) self_updater: Arc<SelfUpdater>,
    pub(crate) environment_id: String,
}

pub fn app(
    repo: Arc<ExecutionRepo>,
    job_tx: mpsc::Sender<UpdateJob>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    self_updater: Arc<SelfUpdater>,
    environment_id: String,
) -> Router {
    let state = AppState {
        repo,
        job_tx,
        progress_tx,
        self_updater,
        environment_id,
    };
    Router::new()
        .route("/", get(|| async { "capstan update orchestrator" })) // GET /
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/updates", post(http::trigger_update_handler)) // POST /api/updates
        .route("/api/self-update", post(http::trigger_self_update_handler)) // POST /api/self-update
        .route("/api/executions", get(http::recent_executions_handler)) // GET /api/executions
        .route("/api/executions/{id}", get(http::execution_handler)) // GET /api/executions/{id}
        .route("/api/updates/events", get(sse::events_handler)) // SSE /api/updates/events
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
