use std::sync::Arc;
use std::time::Instant;

use crate::metrics::{record_completion_failure, record_grading, ActiveStreamGuard};
use crate::models::grading::{GradingFailureKind, SubmitIntent};
use crate::models::playground::{DisplaySource, DisplayState, InFlightResult, InFlightStatus};
use crate::models::submission::{Submission, SubmissionFields};
use crate::models::Exercise;

use super::completion_service::{
    collect_completion, CompletionError, CompletionRequest, CompletionService,
};
use super::submission_store::{StoreError, SubmissionStore};
use super::submit_lock::{user_lock_key, LockError, SubmitLocks};

/// Text the completion service is told to end a correct grading with.
pub const VERDICT_MARKER: &str = "{ passed: true }";

/// Plain substring check for the verdict marker. Anything else, including
/// `{ passed: false }`, garbage or a cut-off stream, is a fail.
pub fn derive_verdict(response_text: &str) -> bool {
    response_text.contains(VERDICT_MARKER)
}

pub fn find_record<'a>(
    submissions: &'a [Submission],
    exercise: Exercise,
    user_id: &str,
) -> Option<&'a Submission> {
    submissions.iter().find(|s| s.belongs_to(user_id, exercise))
}

/// Must be called on a fresh read: a concurrent submit for the same key can
/// create the record at any time.
pub fn classify_submit_intent(
    submissions: &[Submission],
    exercise: Exercise,
    user_id: &str,
) -> SubmitIntent {
    match find_record(submissions, exercise, user_id) {
        Some(existing) => SubmitIntent::Update(existing.id.clone()),
        None => SubmitIntent::Create,
    }
}

/// In-flight output for `exercise` wins over the persisted record; output
/// tagged with any other exercise is ignored.
pub fn resolve_display_state(
    submissions: &[Submission],
    exercise: Exercise,
    user_id: &str,
    in_flight: Option<&InFlightResult>,
) -> DisplayState {
    if let Some(result) = in_flight.filter(|r| r.exercise == exercise) {
        let (passed, grading) = match result.status {
            InFlightStatus::Streaming => (None, true),
            InFlightStatus::Completed { passed } => (Some(passed), false),
        };
        return DisplayState {
            exercise,
            code: result.code.clone(),
            feedback: result.feedback.clone(),
            passed,
            source: DisplaySource::InFlight,
            grading,
        };
    }

    match find_record(submissions, exercise, user_id) {
        Some(record) => DisplayState {
            exercise,
            code: record.submission.clone(),
            feedback: record.response.clone(),
            passed: Some(record.passed),
            source: DisplaySource::Persisted,
            grading: false,
        },
        None => DisplayState::empty(exercise),
    }
}

pub fn ensure_not_empty(code: &str) -> Result<(), GradingError> {
    if code.trim().is_empty() {
        return Err(GradingError::EmptySubmission);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error("Submission is empty")]
    EmptySubmission,
    #[error("Grading failed: {0}")]
    CompletionFailure(#[from] CompletionError),
    #[error("Feedback received but not saved: {source}")]
    PersistenceFailure {
        feedback: String,
        passed: bool,
        source: PersistenceError,
    },
    #[error("Submission {0} not found")]
    NotFound(String),
    #[error("Submission store unavailable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for GradingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => GradingError::NotFound(id),
            other => GradingError::Store(other),
        }
    }
}

impl From<LockError> for GradingError {
    fn from(err: LockError) -> Self {
        GradingError::Store(StoreError::Other(anyhow::Error::new(err)))
    }
}

impl GradingError {
    pub fn failure_kind(&self) -> GradingFailureKind {
        match self {
            GradingError::EmptySubmission => GradingFailureKind::EmptySubmission,
            GradingError::CompletionFailure(_) => GradingFailureKind::CompletionFailure,
            GradingError::PersistenceFailure { .. } | GradingError::Store(_) => {
                GradingFailureKind::PersistenceFailure
            }
            GradingError::NotFound(_) => GradingFailureKind::NotFound,
        }
    }

    /// Feedback that survived the failure and should stay on screen.
    pub fn feedback(&self) -> Option<(&str, bool)> {
        match self {
            GradingError::PersistenceFailure {
                feedback, passed, ..
            } => Some((feedback.as_str(), *passed)),
            _ => None,
        }
    }

    /// True when the cached record list can no longer be trusted.
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            GradingError::NotFound(_)
                | GradingError::PersistenceFailure {
                    source: PersistenceError::Store(StoreError::NotFound(_)),
                    ..
                }
        )
    }
}

#[derive(Debug, Clone)]
pub struct GradingOutcome {
    pub submission: Submission,
    pub intent: SubmitIntent,
    pub feedback: String,
    pub passed: bool,
}

/// Owns every write to the submission store.
#[derive(Clone)]
pub struct SessionReconciler {
    store: Arc<dyn SubmissionStore>,
    completions: Arc<dyn CompletionService>,
    locks: Arc<dyn SubmitLocks>,
}

impl SessionReconciler {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        completions: Arc<dyn CompletionService>,
        locks: Arc<dyn SubmitLocks>,
    ) -> Self {
        Self {
            store,
            completions,
            locks,
        }
    }

    pub fn completions(&self) -> &Arc<dyn CompletionService> {
        &self.completions
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Submission>, GradingError> {
        Ok(self.store.list(user_id).await?)
    }

    /// Grades `code`, streaming chunks to `on_chunk`, and persists the result
    /// once the full text is in. At most one store write per call; nothing is
    /// written when the completion fails.
    pub async fn submit_for_grading<F>(
        &self,
        user_id: &str,
        code: &str,
        exercise: Exercise,
        on_chunk: F,
    ) -> Result<GradingOutcome, GradingError>
    where
        F: FnMut(&str) + Send,
    {
        ensure_not_empty(code)?;

        tracing::info!(
            "Grading submission: user={}, exercise={}, bytes={}",
            user_id,
            exercise,
            code.len()
        );
        let started = Instant::now();
        let _active = ActiveStreamGuard::enter();

        let feedback = match self.collect_feedback(code, exercise, on_chunk).await {
            Ok(text) => text,
            Err(e) => {
                record_completion_failure(completion_failure_reason(&e));
                tracing::error!(
                    "Completion failed: user={}, exercise={}, error={}",
                    user_id,
                    exercise,
                    e
                );
                return Err(GradingError::CompletionFailure(e));
            }
        };

        let passed = derive_verdict(&feedback);
        record_grading(exercise.as_str(), passed, started.elapsed().as_secs_f64());

        let fields = SubmissionFields {
            user_id: user_id.to_string(),
            exercise,
            submission: code.to_string(),
            response: feedback.clone(),
            passed,
        };

        match self.persist(fields).await {
            Ok((submission, intent)) => {
                tracing::info!(
                    "Grading stored: user={}, exercise={}, id={}, intent={:?}, passed={}",
                    user_id,
                    exercise,
                    submission.id,
                    intent,
                    passed
                );
                Ok(GradingOutcome {
                    submission,
                    intent,
                    feedback,
                    passed,
                })
            }
            Err(source) => {
                tracing::error!(
                    "Failed to store grading: user={}, exercise={}, error={}",
                    user_id,
                    exercise,
                    source
                );
                Err(GradingError::PersistenceFailure {
                    feedback,
                    passed,
                    source,
                })
            }
        }
    }

    async fn collect_feedback<F>(
        &self,
        code: &str,
        exercise: Exercise,
        on_chunk: F,
    ) -> Result<String, CompletionError>
    where
        F: FnMut(&str) + Send,
    {
        let stream = self
            .completions
            .stream(CompletionRequest::grading(code, exercise))
            .await?;
        collect_completion(stream, on_chunk).await
    }

    async fn persist(
        &self,
        fields: SubmissionFields,
    ) -> Result<(Submission, SubmitIntent), PersistenceError> {
        let lease = self.locks.acquire(&user_lock_key(&fields.user_id)).await?;
        let result = self.write_under_lock(fields).await;
        self.locks.release(lease).await;
        result
    }

    /// Reads, classifies and writes while the user's lock is held. A create
    /// that hits the uniqueness key means another instance got there first;
    /// that case is re-read and turned into an update once.
    async fn write_under_lock(
        &self,
        fields: SubmissionFields,
    ) -> Result<(Submission, SubmitIntent), PersistenceError> {
        let mut reclassified = false;
        loop {
            let current = self.store.list(&fields.user_id).await?;
            let intent = classify_submit_intent(&current, fields.exercise, &fields.user_id);

            let written = match &intent {
                SubmitIntent::Create => self.store.create(fields.clone()).await,
                SubmitIntent::Update(id) => self.store.update(id, fields.clone()).await,
            };

            match written {
                Ok(submission) => return Ok((submission, intent)),
                Err(StoreError::Conflict { .. }) if !reclassified => {
                    tracing::warn!(
                        "Submission key taken concurrently: user={}, exercise={}; re-reading",
                        fields.user_id,
                        fields.exercise
                    );
                    reclassified = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes the user's record for `exercise` ("reset").
    pub async fn reset(&self, user_id: &str, exercise: Exercise) -> Result<Submission, GradingError> {
        let lease = self.locks.acquire(&user_lock_key(user_id)).await?;
        let result = async {
            let records = self.store.list(user_id).await?;
            let record = find_record(&records, exercise, user_id)
                .cloned()
                .ok_or_else(|| GradingError::NotFound(format!("{} / {}", user_id, exercise)))?;
            self.store.delete(&record.id).await?;
            Ok::<_, GradingError>(record)
        }
        .await;
        self.locks.release(lease).await;

        if let Ok(record) = &result {
            tracing::info!(
                "Submission reset: user={}, exercise={}, id={}",
                user_id,
                exercise,
                record.id
            );
        }
        result
    }

    /// Deletes by identifier; ids owned by other users are reported as missing.
    pub async fn delete(&self, user_id: &str, id: &str) -> Result<Submission, GradingError> {
        let lease = self.locks.acquire(&user_lock_key(user_id)).await?;
        let result = async {
            let records = self.store.list(user_id).await?;
            let record = records
                .into_iter()
                .find(|s| s.id == id)
                .ok_or_else(|| GradingError::NotFound(id.to_string()))?;
            self.store.delete(&record.id).await?;
            Ok::<_, GradingError>(record)
        }
        .await;
        self.locks.release(lease).await;
        result
    }
}

fn completion_failure_reason(error: &CompletionError) -> &'static str {
    match error {
        CompletionError::Transport(_) => "transport",
        CompletionError::Status { .. } => "status",
        CompletionError::Provider(_) => "provider",
        CompletionError::Truncated => "truncated",
        CompletionError::Empty => "empty",
    }
}
