use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use super::actor;
use crate::{
    error::AppResult,
    extractors::ValidatedJson,
    middlewares::auth::JwtClaims,
    models::progress::{StartAttemptRequest, UpdateCorrectAnswersRequest},
    services::AppState,
};

/// POST /api/tasks/prog
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidatedJson(req): ValidatedJson<StartAttemptRequest>,
) -> AppResult<impl IntoResponse> {
    tracing::info!(user_id = %claims.sub, task_id = %req.task_id, "Starting task attempt");

    let view = state
        .progress_service()
        .start_attempt(&claims.sub, req)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/task_prog/{id}
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let view = state.progress_service().get_attempt(&id, actor(&claims)).await?;
    Ok(Json(view))
}

/// PUT /api/task_prog/{id}
pub async fn update_correct_answers(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<UpdateCorrectAnswersRequest>,
) -> AppResult<impl IntoResponse> {
    let view = state
        .progress_service()
        .update_correct_answers(&id, actor(&claims), req)
        .await?;
    Ok(Json(view))
}

/// PATCH /api/task_prog/{id}
pub async fn finish_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    tracing::info!(task_progress_id = %id, user_id = %claims.sub, "Finishing task attempt");

    let view = state
        .progress_service()
        .finish_attempt(&id, actor(&claims))
        .await?;
    Ok(Json(view))
}
