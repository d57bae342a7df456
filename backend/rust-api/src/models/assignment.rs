use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Expired,
    Solved,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Solved => "solved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssignmentStatus::Pending)
    }

    /// Only pending → expired and pending → solved exist.
    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        matches!(
            (self, next),
            (AssignmentStatus::Pending, AssignmentStatus::Expired)
                | (AssignmentStatus::Pending, AssignmentStatus::Solved)
        )
    }
}

/// Teacher → student assignment ("assigned_tasks").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignedTask {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub assigned_by: String,
    pub due_date: DateTime<Utc>,
    pub assigned_at: DateTime<Utc>,
    pub status: AssignmentStatus,
}

impl AssignedTask {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_date < now
    }

    /// Whether a completion at `now` may flip this assignment to solved.
    pub fn can_be_solved_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AssignmentStatus::Pending && !self.is_overdue(now)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAssignmentRequest {
    #[validate(length(min = 1, max = 64, message = "user_id must not be empty"))]
    pub user_id: String,

    #[validate(length(min = 1, max = 64, message = "task_id must not be empty"))]
    pub task_id: String,

    pub due_date: DateTime<Utc>,
}
