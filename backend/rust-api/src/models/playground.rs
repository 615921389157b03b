use serde::{Deserialize, Serialize};
use validator::Validate;

use super::Exercise;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplaySource {
    InFlight,
    Persisted,
    Empty,
}

/// Contents of the editor pane and the feedback pane for one exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayState {
    pub exercise: Exercise,
    pub code: String,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    pub source: DisplaySource,
    pub grading: bool,
}

impl DisplayState {
    pub fn empty(exercise: Exercise) -> Self {
        Self {
            exercise,
            code: String::new(),
            feedback: String::new(),
            passed: None,
            source: DisplaySource::Empty,
            grading: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightStatus {
    Streaming,
    Completed { passed: bool },
}

/// Output of a grading request held in memory, tagged with the exercise that
/// was selected when the request was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightResult {
    pub exercise: Exercise,
    pub code: String,
    pub feedback: String,
    pub status: InFlightStatus,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SelectExerciseRequest {
    pub exercise: Exercise,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateBufferRequest {
    #[validate(length(max = 20000, message = "code must be at most 20000 characters"))]
    pub code: String,
}
