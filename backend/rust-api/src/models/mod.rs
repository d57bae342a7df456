use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod assignment;
pub mod progress;
pub mod time_constraint;
pub mod timer;

pub use assignment::{AssignedTask, AssignmentStatus};
pub use progress::{ExerciseProgress, TaskProgress};
pub use time_constraint::TimeConstraint;

/// A named bundle of exercises, read from the "tasks" collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub created_by: String,
    /// Maximum attempts per user, 0 = unlimited.
    pub tries_number: u32,
    pub exercises_number: u32,
    /// `"HH:MM:SS"`, `"00:00:00"` = unlimited.
    pub time_constraint: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn time_budget(
        &self,
    ) -> Result<TimeConstraint, time_constraint::TimeConstraintError> {
        TimeConstraint::parse(&self.time_constraint)
    }

    pub fn allows_another_try(&self, tries_used: u64) -> bool {
        self.tries_number == 0 || tries_used < u64::from(self.tries_number)
    }
}

/// One sentence-building question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exercise {
    pub id: String,
    /// Russian prompt shown to the student.
    pub translation: String,
    pub correct_sentence: String,
    /// Shuffled candidate words.
    pub words: Vec<String>,
    pub explanation: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// `None` while the exercise sits in the unassigned pool.
    pub task_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}
