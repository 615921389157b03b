use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    models::{
        grading::{FeedbackChunk, Graded, GradingEvent, GradingFailed},
        Exercise,
    },
    services::{
        playground_session::{lock_session, GradingTicket, SessionHandle},
        reconciler::{GradingError, GradingOutcome},
        AppState,
    },
};

/// Grading request handed to a background task.
pub struct GradingJob {
    pub state: Arc<AppState>,
    pub user_id: String,
    pub exercise: Exercise,
    pub code: String,
    /// Playground session to mirror progress into, with the ticket it issued.
    /// Without one, the user's cached session view is just marked stale.
    pub session: Option<(SessionHandle, GradingTicket)>,
}

/// Starts grading on its own task and returns the SSE response that follows
/// it. The task runs to completion even if the client goes away, so the
/// result is still persisted.
pub fn grading_sse(job: GradingJob) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_grading(job, tx));
    Sse::new(event_stream(rx)).keep_alive(KeepAlive::default())
}

async fn run_grading(job: GradingJob, tx: mpsc::UnboundedSender<GradingEvent>) {
    let GradingJob {
        state,
        user_id,
        exercise,
        code,
        session,
    } = job;

    let chunk_session = session.clone();
    let chunk_tx = tx.clone();
    let on_chunk = move |chunk: &str| {
        if let Some((handle, ticket)) = &chunk_session {
            lock_session(handle).apply_chunk(ticket, chunk);
        }
        // Receiver gone means the client disconnected; keep grading anyway
        let _ = chunk_tx.send(GradingEvent::FeedbackChunk(FeedbackChunk {
            exercise,
            text: chunk.to_string(),
        }));
    };

    let result = state
        .reconciler
        .submit_for_grading(&user_id, &code, exercise, on_chunk)
        .await;

    match &session {
        Some((handle, ticket)) => lock_session(handle).finish(ticket, &result),
        None => state.sessions.invalidate(&user_id),
    }

    let _ = tx.send(terminal_event(exercise, result));
}

fn terminal_event(
    exercise: Exercise,
    result: Result<GradingOutcome, GradingError>,
) -> GradingEvent {
    match result {
        Ok(outcome) => GradingEvent::Graded(Graded {
            submission: outcome.submission,
            intent: outcome.intent,
            passed: outcome.passed,
        }),
        Err(e) => {
            let (feedback, passed) = match e.feedback() {
                Some((text, passed)) => (Some(text.to_string()), Some(passed)),
                None => (None, None),
            };
            GradingEvent::GradingFailed(GradingFailed {
                exercise,
                kind: e.failure_kind(),
                message: e.to_string(),
                feedback,
                passed,
            })
        }
    }
}

/// Drains grading events into SSE frames; ends once the grading task drops
/// its sender.
fn event_stream(
    rx: mpsc::UnboundedReceiver<GradingEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        let grading_event = rx.recv().await?;
        let event = Event::default()
            .event(grading_event.event_name())
            .data(grading_event.to_sse_data());

        if grading_event.is_terminal() {
            tracing::debug!("Grading stream finished with {}", grading_event.event_name());
        }

        Some((Ok(event), rx))
    })
}
