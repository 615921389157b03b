use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::sync::Arc;

use super::ApiError;
use crate::{
    extractors::ValidJson,
    metrics::record_completion_failure,
    middlewares::auth::CurrentUser,
    models::grading::CompletionPromptRequest,
    services::{completion_service::CompletionRequest, AppState},
};

/// POST /api/v1/completion
///
/// Forwards a prompt to the completion provider and streams the generated text
/// back as plain text. Nothing is stored.
pub async fn stream_completion(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    ValidJson(req): ValidJson<CompletionPromptRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Completion proxy request: user={}, prompt_len={}",
        user_id,
        req.prompt.len()
    );

    let stream = state
        .reconciler
        .completions()
        .stream(CompletionRequest::raw(req.prompt))
        .await
        .inspect_err(|e| {
            record_completion_failure("proxy");
            tracing::error!("Completion proxy failed to open stream: {}", e);
        })?;

    // A mid-stream error ends the body early; the client sees a short response.
    let body = Body::from_stream(stream.map(|chunk| {
        chunk.inspect_err(|e| {
            record_completion_failure("proxy");
            tracing::warn!("Completion proxy stream broke: {}", e);
        })
    }));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}
