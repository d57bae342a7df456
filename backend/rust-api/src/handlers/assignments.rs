use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::AppResult, extractors::ValidatedJson, middlewares::auth::JwtClaims,
    models::assignment::CreateAssignmentRequest, services::AppState,
};

/// GET /api/assignedTasks
pub async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> AppResult<impl IntoResponse> {
    let assignments = state.assignment_service().list_for_user(&claims.sub).await?;
    Ok(Json(assignments))
}

/// POST /api/assignedTasks (teacher/admin)
pub async fn create_assignment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidatedJson(req): ValidatedJson<CreateAssignmentRequest>,
) -> AppResult<impl IntoResponse> {
    let assignment = state
        .assignment_service()
        .create_assignment(&claims.sub, req)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// PATCH /api/assignedTasks/{taskId}
pub async fn mark_solved(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(task_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let assignment = state
        .assignment_service()
        .mark_solved(&claims.sub, &task_id)
        .await?;
    Ok(Json(assignment))
}
