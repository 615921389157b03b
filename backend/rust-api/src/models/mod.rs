use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod grading;
pub mod playground;
pub mod submission;

/// Exercises a user can be graded on. Wire names match what the editor
/// dropdown shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Exercise {
    #[default]
    #[serde(rename = "Linear search")]
    LinearSearch,
    #[serde(rename = "Binary search")]
    BinarySearch,
}

impl Exercise {
    pub const ALL: [Exercise; 2] = [Exercise::LinearSearch, Exercise::BinarySearch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exercise::LinearSearch => "Linear search",
            Exercise::BinarySearch => "Binary search",
        }
    }
}

impl fmt::Display for Exercise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown exercise '{0}'")]
pub struct UnknownExercise(pub String);

impl FromStr for Exercise {
    type Err = UnknownExercise;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Exercise::ALL
            .into_iter()
            .find(|exercise| exercise.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownExercise(s.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct ExerciseListResponse {
    pub exercises: Vec<Exercise>,
    pub default: Exercise,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exercise_wire_names() {
        assert_eq!(
            serde_json::to_string(&Exercise::LinearSearch).unwrap(),
            "\"Linear search\""
        );
        let parsed: Exercise = serde_json::from_str("\"Binary search\"").unwrap();
        assert_eq!(parsed, Exercise::BinarySearch);
        assert!(serde_json::from_str::<Exercise>("\"Bubble sort\"").is_err());
    }

    #[test]
    fn exercise_from_path_segment() {
        assert_eq!("linear search".parse(), Ok(Exercise::LinearSearch));
        assert_eq!(" Binary search ".parse(), Ok(Exercise::BinarySearch));
        assert!("quick sort".parse::<Exercise>().is_err());
    }

    #[test]
    fn unknown_exercise_message_names_input() {
        let err = "quick sort".parse::<Exercise>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown exercise 'quick sort'");

        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn first_exercise_is_default() {
        assert_eq!(Exercise::default(), Exercise::ALL[0]);
    }
}
