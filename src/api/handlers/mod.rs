use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::AppState;
use crate::jobs::{JobError, JobOutcome};
use crate::models::*;
use crate::notifier::NotifyOutcome;
use crate::urgency::UrgencyTier;

// ============================================================
// Error Handling
// ============================================================

/// Log an internal error and return a sanitized response to the client.
///
/// A few store errors are caller mistakes and are passed through: missing
/// parents, locked due dates and duplicate matter references.
fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    let msg = e.to_string();

    if msg.contains("not found") {
        tracing::warn!("Validation error: {}", msg);
        return (StatusCode::BAD_REQUEST, msg);
    }
    if msg.contains("locked") {
        tracing::warn!("Conflict: {}", msg);
        return (StatusCode::CONFLICT, msg);
    }
    if msg.contains("UNIQUE constraint failed: matters.reference") {
        tracing::warn!("Conflict: {}", msg);
        return (
            StatusCode::CONFLICT,
            "Matter reference already exists".to_string(),
        );
    }

    tracing::error!("Internal error: {}", msg);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Matters
// ============================================================

pub async fn list_matters(
    State(state): State<AppState>,
) -> Result<Json<Vec<Matter>>, (StatusCode, String)> {
    state.db.get_all_matters().map(Json).map_err(internal_error)
}

pub async fn get_matter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Matter>, (StatusCode, String)> {
    state
        .db
        .get_matter(id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Matter not found".to_string()))
}

pub async fn create_matter(
    State(state): State<AppState>,
    Json(input): Json<CreateMatterInput>,
) -> Result<(StatusCode, Json<Matter>), (StatusCode, String)> {
    state
        .db
        .create_matter(input)
        .map(|m| (StatusCode::CREATED, Json(m)))
        .map_err(internal_error)
}

pub async fn delete_matter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.db.delete_matter(id).map_err(internal_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "Matter not found".to_string()))
    }
}

/// Response to a status change: the committed matter, its history entry,
/// and what the notifier did about it.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusChangeResponse {
    pub matter: Matter,
    pub previous_status: MatterStatus,
    pub event: Option<StatusChangeEvent>,
    pub notification: NotifyOutcome,
}

/// Commit the new status, then notify. Notification problems never fail
/// the request; the status change is already durable.
pub async fn change_matter_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<ChangeStatusInput>,
) -> Result<Json<StatusChangeResponse>, (StatusCode, String)> {
    let result = state
        .db
        .change_matter_status(id, input)
        .map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "Matter not found".to_string()))?;

    let outcome = match &result.event {
        Some(event) => state.notifier.on_event(&result.matter, event).await,
        None => NotifyOutcome::Unchanged,
    };

    Ok(Json(StatusChangeResponse {
        matter: result.matter,
        previous_status: result.previous_status,
        event: result.event,
        notification: outcome,
    }))
}

pub async fn get_status_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusChangeEvent>>, (StatusCode, String)> {
    state
        .db
        .get_matter(id)
        .map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "Matter not found".to_string()))?;

    state
        .db
        .get_status_history(id)
        .map(Json)
        .map_err(internal_error)
}

// ============================================================
// Tasks
// ============================================================

/// A task with its current urgency badge. `urgency` is absent for
/// completed tasks and tasks without a due date.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub urgency: Option<UrgencyTier>,
}

fn task_view(state: &AppState, task: Task) -> TaskView {
    let urgency = if task.done {
        None
    } else {
        state.thresholds.classify(&task, Utc::now()).ok()
    };
    TaskView { task, urgency }
}

pub async fn list_matter_tasks(
    State(state): State<AppState>,
    Path(matter_id): Path<Uuid>,
) -> Result<Json<Vec<TaskView>>, (StatusCode, String)> {
    state
        .db
        .get_matter(matter_id)
        .map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "Matter not found".to_string()))?;

    let tasks = state
        .db
        .get_tasks_by_matter(matter_id)
        .map_err(internal_error)?;
    Ok(Json(
        tasks.into_iter().map(|t| task_view(&state, t)).collect(),
    ))
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(matter_id): Path<Uuid>,
    Json(input): Json<CreateTaskInput>,
) -> Result<(StatusCode, Json<TaskView>), (StatusCode, String)> {
    state
        .db
        .create_task(matter_id, input)
        .map(|t| (StatusCode::CREATED, Json(task_view(&state, t))))
        .map_err(internal_error)
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, (StatusCode, String)> {
    state
        .db
        .get_task(id)
        .map_err(internal_error)?
        .map(|t| Json(task_view(&state, t)))
        .ok_or((StatusCode::NOT_FOUND, "Task not found".to_string()))
}

pub async fn reschedule_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<RescheduleTaskInput>,
) -> Result<Json<TaskView>, (StatusCode, String)> {
    state
        .db
        .reschedule_task(id, input)
        .map_err(internal_error)?
        .map(|t| Json(task_view(&state, t)))
        .ok_or((StatusCode::NOT_FOUND, "Task not found".to_string()))
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, (StatusCode, String)> {
    state
        .db
        .complete_task(id)
        .map_err(internal_error)?
        .map(|t| Json(task_view(&state, t)))
        .ok_or((StatusCode::NOT_FOUND, "Task not found".to_string()))
}

pub async fn get_task_notifications(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<NotificationRecord>>, (StatusCode, String)> {
    state
        .db
        .get_notifications_for(id)
        .map(Json)
        .map_err(internal_error)
}

// ============================================================
// Jobs
// ============================================================

#[derive(Debug, Deserialize)]
pub struct RunLogQuery {
    pub job: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunLogQuery>,
) -> Result<Json<Vec<RunLogEntry>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(20).min(500);
    state
        .db
        .get_run_log(query.job.as_deref(), limit)
        .map(Json)
        .map_err(internal_error)
}

#[derive(Debug, Deserialize)]
pub struct RunJobQuery {
    /// Defaults to now.
    pub as_of: Option<DateTime<Utc>>,
}

/// Trigger the urgent-task job by hand. Answers 200 with the outcome,
/// including a skip when a run is already in progress.
pub async fn run_urgent_job(
    State(state): State<AppState>,
    Query(query): Query<RunJobQuery>,
) -> Result<Json<JobOutcome>, (StatusCode, String)> {
    let as_of = query.as_of.unwrap_or_else(Utc::now);
    match state.job.run(as_of, &CancellationToken::new()).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ JobError::DataLoad(_)) => {
            tracing::error!(error = %e, "manual urgent-task run failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "Task store unavailable; run recorded as failed".to_string(),
            ))
        }
        Err(e) => Err(internal_error(e)),
    }
}
