// JSON handlers: version, trigger update, trigger self-update, executions

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use super::AppState;
use crate::execution_repo::ExecutionLedger;
use crate::updater::{CancelFlag, UpdateRequest};
use crate::version::{NAME, VERSION};
use crate::worker::UpdateJob;

/// GET /version — returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TriggerUpdateBody {
    target: String,
    #[serde(default = "default_triggered_by")]
    triggered_by: String,
    #[serde(default)]
    force: bool,
}

fn default_triggered_by() -> String {
    "api".to_string()
}

/// POST /api/updates — open a ledger record and enqueue the update; returns
/// the execution id so the caller can follow the progress stream.
pub(super) async fn trigger_update_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<TriggerUpdateBody>,
) -> impl IntoResponse {
    if body.target.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "target must be non-empty" })),
        );
    }
    let execution_id = match state
        .repo
        .begin(&body.target, &state.environment_id, &body.triggered_by)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open execution record");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "could not open execution record" })),
            );
        }
    };

    let job = UpdateJob {
        execution_id,
        request: UpdateRequest {
            target: body.target,
            environment_id: state.environment_id.clone(),
            triggered_by: body.triggered_by,
            force: body.force,
        },
        cancel: CancelFlag::new(),
    };
    if state.job_tx.send(job).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "error": "dispatcher not running" })),
        );
    }
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "executionId": execution_id })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TriggerSelfUpdateBody {
    #[serde(default = "default_triggered_by")]
    triggered_by: String,
}

/// POST /api/self-update — runs the handoff pipeline in its own task. The
/// response only acknowledges the launch attempt; the execution's last
/// observable status is `launched`.
pub(super) async fn trigger_self_update_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<TriggerSelfUpdateBody>,
) -> impl IntoResponse {
    let execution_id = match state
        .repo
        .begin("self", &state.environment_id, &body.triggered_by)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open execution record");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "could not open execution record" })),
            );
        }
    };
    let self_updater = state.self_updater.clone();
    tokio::spawn(async move {
        self_updater.run(execution_id).await;
    });
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "executionId": execution_id })),
    )
}

#[derive(Debug, Deserialize)]
pub(super) struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/executions — most recent executions, newest first.
pub(super) async fn recent_executions_handler(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    match state.repo.recent(query.limit.clamp(1, 500)).await {
        Ok(executions) => (StatusCode::OK, axum::Json(serde_json::json!(executions))),
        Err(e) => {
            tracing::warn!(error = %e, "failed to query executions");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "query failed" })),
            )
        }
    }
}

/// GET /api/executions/{id} — one execution with its log lines.
pub(super) async fn execution_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.repo.get(id).await {
        Ok(Some(execution)) => (StatusCode::OK, axum::Json(serde_json::json!(execution))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "no such execution" })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load execution");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "query failed" })),
            )
        }
    }
}
