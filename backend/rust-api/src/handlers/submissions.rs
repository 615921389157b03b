use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use super::sse::{grading_sse, GradingJob};
use super::ApiError;
use crate::{
    extractors::ValidJson,
    middlewares::auth::CurrentUser,
    models::{
        submission::{GradeSubmissionRequest, Submission},
        Exercise, ExerciseListResponse, UnknownExercise,
    },
    services::{reconciler::ensure_not_empty, AppState},
};

/// GET /api/v1/exercises
pub async fn list_exercises() -> Json<ExerciseListResponse> {
    Json(ExerciseListResponse {
        exercises: Exercise::ALL.to_vec(),
        default: Exercise::default(),
    })
}

/// GET /api/v1/submissions
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<Submission>>, ApiError> {
    let submissions = state.reconciler.list(&user_id).await?;
    tracing::debug!(
        "Listed submissions: user={}, count={}",
        user_id,
        submissions.len()
    );
    Ok(Json(submissions))
}

/// POST /api/v1/submissions
///
/// Grades the posted code and streams the feedback back as SSE.
pub async fn grade_submission(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<GradeSubmissionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(e) = ensure_not_empty(&req.code) {
        tracing::warn!("Rejected empty submission: user={}", user_id);
        return Err(e.into());
    }

    Ok(grading_sse(GradingJob {
        state: state.clone(),
        user_id,
        exercise: req.exercise,
        code: req.code,
        session: None,
    }))
}

/// DELETE /api/v1/submissions/{id}
pub async fn delete_submission(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Submission>, ApiError> {
    let deleted = state.reconciler.delete(&user_id, &id).await?;
    state.sessions.forget(&user_id, deleted.exercise);
    tracing::info!("Submission deleted: user={}, id={}", user_id, id);
    Ok(Json(deleted))
}

/// DELETE /api/v1/submissions/exercise/{exercise}
pub async fn reset_exercise(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(exercise): Path<String>,
) -> Result<Json<Submission>, ApiError> {
    let exercise: Exercise = exercise
        .parse()
        .map_err(|e: UnknownExercise| ApiError::bad_request(e.to_string()))?;

    let deleted = state.reconciler.reset(&user_id, exercise).await?;
    state.sessions.forget(&user_id, exercise);
    Ok(Json(deleted))
}
