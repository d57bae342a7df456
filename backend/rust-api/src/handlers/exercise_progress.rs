use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use super::actor;
use crate::{
    error::AppResult, extractors::ValidatedJson, middlewares::auth::JwtClaims,
    models::progress::SubmitExerciseAnswerRequest, services::AppState,
};

/// PATCH /api/exerciseProg/{id}
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<SubmitExerciseAnswerRequest>,
) -> AppResult<impl IntoResponse> {
    let response = state
        .progress_service()
        .submit_answer(&id, actor(&claims), req)
        .await?;
    Ok(Json(response))
}
