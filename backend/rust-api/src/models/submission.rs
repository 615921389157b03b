use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::Exercise;

/// Latest graded attempt of one user on one exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub user_id: String,
    pub exercise: Exercise,
    pub submission: String,
    pub response: String,
    pub passed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full field set written by both create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionFields {
    pub user_id: String,
    pub exercise: Exercise,
    pub submission: String,
    pub response: String,
    pub passed: bool,
}

impl Submission {
    pub fn belongs_to(&self, user_id: &str, exercise: Exercise) -> bool {
        self.user_id == user_id && self.exercise == exercise
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct GradeSubmissionRequest {
    #[validate(length(max = 20000, message = "code must be at most 20000 characters"))]
    pub code: String,
    pub exercise: Exercise,
}

