use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use super::sse::{grading_sse, GradingJob};
use super::ApiError;
use crate::{
    extractors::ValidJson,
    middlewares::auth::CurrentUser,
    models::playground::{DisplayState, SelectExerciseRequest, UpdateBufferRequest},
    services::{
        playground_session::lock_session,
        reconciler::{ensure_not_empty, GradingError},
        AppState,
    },
};

/// GET /api/v1/playground
pub async fn get_playground(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<DisplayState>, ApiError> {
    let handle = state.sessions.load(&state.reconciler, &user_id).await?;
    let display = lock_session(&handle).display();
    Ok(Json(display))
}

/// PUT /api/v1/playground/exercise
pub async fn select_exercise(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<SelectExerciseRequest>,
) -> Result<Json<DisplayState>, ApiError> {
    let handle = state.sessions.load(&state.reconciler, &user_id).await?;
    let display = {
        let mut session = lock_session(&handle);
        session.select_exercise(req.exercise);
        session.display()
    };
    tracing::debug!("Exercise selected: user={}, exercise={}", user_id, req.exercise);
    Ok(Json(display))
}

/// PUT /api/v1/playground/buffer
pub async fn update_buffer(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<UpdateBufferRequest>,
) -> Result<Json<DisplayState>, ApiError> {
    let handle = state.sessions.load(&state.reconciler, &user_id).await?;
    let display = {
        let mut session = lock_session(&handle);
        session.set_buffer(req.code);
        session.display()
    };
    Ok(Json(display))
}

/// POST /api/v1/playground/submit
///
/// Grades the current buffer for the selected exercise. Progress is mirrored
/// into the session, so `GET /api/v1/playground` shows it too.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.sessions.load(&state.reconciler, &user_id).await?;

    let ticket = {
        let mut session = lock_session(&handle);
        if let Err(e) = ensure_not_empty(session.buffer()) {
            tracing::warn!("Rejected empty submission: user={}", user_id);
            return Err(e.into());
        }
        session.begin_grading()
    };

    tracing::info!(
        "Playground submit: user={}, exercise={}, ticket={}",
        user_id,
        ticket.exercise,
        ticket.id
    );

    Ok(grading_sse(GradingJob {
        state: state.clone(),
        user_id,
        exercise: ticket.exercise,
        code: ticket.code.clone(),
        session: Some((handle, ticket)),
    }))
}

/// DELETE /api/v1/playground/submission
///
/// Resets the selected exercise. Resetting an exercise with no record is not
/// an error here; the view is simply already empty.
pub async fn reset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<DisplayState>, ApiError> {
    let handle = state.sessions.load(&state.reconciler, &user_id).await?;
    let exercise = lock_session(&handle).exercise();

    match state.reconciler.reset(&user_id, exercise).await {
        Ok(_) | Err(GradingError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let display = {
        let mut session = lock_session(&handle);
        session.forget(exercise);
        session.display()
    };
    Ok(Json(display))
}
