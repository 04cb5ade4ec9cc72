//! `POST /tasks`, `POST /tasks/{run_id}/cancel`, `GET /tasks/{run_id}`.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::execution::SubmitRequest;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(submit))
        .route("/tasks/{run_id}", get(get_task))
        .route("/tasks/{run_id}/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    session_id: String,
    #[serde(default)]
    parent_run_id: Option<String>,
    request: serde_json::Value,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn submit(State(state): State<AppState>, Json(body): Json<SubmitBody>) -> Result<Json<crate::execution::SubmitResponse>, AppError> {
    let response = state
        .execution
        .submit(SubmitRequest {
            session_id: body.session_id,
            parent_run_id: body.parent_run_id,
            request: body.request,
            idempotency_key: body.idempotency_key,
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct TaskView {
    run_id: String,
    session_id: String,
    parent_run_id: Option<String>,
    status: alex_durable::TaskStatus,
    attempt_count: u32,
    result: Option<alex_durable::TaskResult>,
}

async fn get_task(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<TaskView>, AppError> {
    let record = state.execution.get(&run_id).await?;
    Ok(Json(TaskView {
        run_id: record.run_id,
        session_id: record.session_id,
        parent_run_id: record.parent_run_id,
        status: record.status,
        attempt_count: record.attempt_count,
        result: record.result,
    }))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    accepted: bool,
}

async fn cancel(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<CancelResponse>, AppError> {
    state.execution.cancel(&run_id).await?;
    Ok(Json(CancelResponse { accepted: true }))
}
