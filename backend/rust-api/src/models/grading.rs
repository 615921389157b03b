use serde::{Deserialize, Serialize};
use validator::Validate;

use super::submission::Submission;
use super::Exercise;

/// Whether a grading write inserts a new record or overwrites an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubmitIntent {
    Create,
    Update(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingFailureKind {
    EmptySubmission,
    CompletionFailure,
    PersistenceFailure,
    NotFound,
}

/// Events pushed over the grading SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GradingEvent {
    FeedbackChunk(FeedbackChunk),
    Graded(Graded),
    GradingFailed(GradingFailed),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackChunk {
    pub exercise: Exercise,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graded {
    pub submission: Submission,
    pub intent: SubmitIntent,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingFailed {
    pub exercise: Exercise,
    pub kind: GradingFailureKind,
    pub message: String,
    /// Feedback that was received before the failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

impl GradingEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            GradingEvent::FeedbackChunk(_) => "feedback-chunk",
            GradingEvent::Graded(_) => "graded",
            GradingEvent::GradingFailed(_) => "grading-failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GradingEvent::FeedbackChunk(_))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompletionPromptRequest {
    #[validate(length(min = 1, max = 24000, message = "prompt must be 1..=24000 characters"))]
    pub prompt: String,
}
