use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// One user's run through a task ("task_progress").
///
/// `completed_at` is set exactly when `is_active` is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub correct_answers: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Assignment the attempt was started from, if any.
    pub assignment_id: Option<String>,
    /// 1-based ordinal among this user's attempts at the task. Unique per
    /// (user, task), so two concurrent starts cannot both take the last try.
    #[serde(default)]
    pub attempt_number: u32,
}

impl TaskProgress {
    pub fn start(
        user_id: &str,
        task_id: &str,
        assignment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task_id: task_id.to_string(),
            correct_answers: 0,
            started_at: now,
            completed_at: None,
            is_active: true,
            assignment_id,
            attempt_number: 1,
        }
    }

    pub fn numbered(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }
}

/// One answer slot inside a task attempt ("exercise_progress").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExerciseProgress {
    pub id: String,
    pub user_id: String,
    pub exercise_id: String,
    pub task_progress_id: String,
    /// Index in the task's exercise sequence.
    pub position: u32,
    pub user_answer: Option<String>,
    pub is_correct: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExerciseProgress {
    pub fn placeholder(attempt: &TaskProgress, exercise_id: &str, position: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: attempt.user_id.clone(),
            exercise_id: exercise_id.to_string(),
            task_progress_id: attempt.id.clone(),
            position,
            user_answer: None,
            is_correct: false,
            completed_at: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.user_answer.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartAttemptRequest {
    #[validate(length(min = 1, max = 64, message = "task_id must not be empty"))]
    pub task_id: String,

    #[validate(length(min = 1, max = 64, message = "assignment_id must not be empty"))]
    pub assignment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateCorrectAnswersRequest {
    #[validate(range(max = 10_000, message = "correct_answers is out of range"))]
    pub correct_answers: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitExerciseAnswerRequest {
    /// Tokens in the order the student arranged them.
    #[validate(
        length(min = 1, max = 200, message = "words must contain 1..=200 tokens"),
        custom(function = "validate_tokens")
    )]
    pub words: Vec<String>,
}

fn validate_tokens(words: &[String]) -> Result<(), ValidationError> {
    if words.iter().any(|w| w.trim().is_empty()) {
        let mut err = ValidationError::new("blank_token");
        err.message = Some("words must not contain blank tokens".into());
        return Err(err);
    }
    Ok(())
}

/// Attempt as returned to the client, with timer state derived server-side.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptView {
    #[serde(flatten)]
    pub progress: TaskProgress,
    pub time_constraint: String,
    pub deadline: Option<DateTime<Utc>>,
    /// `None` when the task has no time limit.
    pub remaining_ms: Option<i64>,
    pub exercises: Vec<ExerciseProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExerciseAnswerResponse {
    pub exercise_progress: ExerciseProgress,
    pub correct_sentence: String,
    pub explanation: Option<String>,
    pub correct_answers: u32,
}
