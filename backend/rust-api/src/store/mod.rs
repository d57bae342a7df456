use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AssignedTask, Exercise, ExerciseProgress, Task, TaskProgress};

pub mod memory;
pub mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

pub const TASKS: &str = "tasks";
pub const EXERCISES: &str = "exercises";
pub const TASK_PROGRESS: &str = "task_progress";
pub const EXERCISE_PROGRESS: &str = "exercise_progress";
pub const ASSIGNED_TASKS: &str = "assigned_tasks";

/// Persistence for tasks, attempts and assignments.
///
/// Every state transition is a conditional write: it only applies when the
/// row is still in the expected state and reports whether it did.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    async fn find_task(&self, task_id: &str) -> anyhow::Result<Option<Task>>;

    /// Exercises attached to a task, in sequence order.
    async fn task_exercises(&self, task_id: &str) -> anyhow::Result<Vec<Exercise>>;

    async fn find_exercise(&self, exercise_id: &str) -> anyhow::Result<Option<Exercise>>;

    async fn count_attempts(&self, user_id: &str, task_id: &str) -> anyhow::Result<u64>;

    /// Inserts the attempt and all of its exercise rows atomically.
    ///
    /// Returns false, writing nothing, when the user already has an attempt
    /// at this task with the same `attempt_number`.
    async fn create_attempt(
        &self,
        attempt: &TaskProgress,
        rows: &[ExerciseProgress],
    ) -> anyhow::Result<bool>;

    async fn find_attempt(&self, id: &str) -> anyhow::Result<Option<TaskProgress>>;

    async fn active_attempts(&self) -> anyhow::Result<Vec<TaskProgress>>;

    /// The user's earliest finalized attempt at the task, by `completed_at`.
    async fn first_completed_attempt(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<TaskProgress>>;

    /// Applies only while the attempt is active.
    async fn set_correct_answers(&self, id: &str, correct_answers: u32) -> anyhow::Result<bool>;

    /// Applies only while the attempt is active.
    async fn increment_correct_answers(&self, id: &str) -> anyhow::Result<bool>;

    /// Flips `is_active` to false and stamps `completed_at`, only if still active.
    async fn finalize_attempt(&self, id: &str, completed_at: DateTime<Utc>)
        -> anyhow::Result<bool>;

    async fn attempt_exercises(&self, task_progress_id: &str)
        -> anyhow::Result<Vec<ExerciseProgress>>;

    async fn find_exercise_progress(&self, id: &str) -> anyhow::Result<Option<ExerciseProgress>>;

    /// Stores the answer, only if the row has not been answered yet.
    async fn record_answer(
        &self,
        id: &str,
        answer: &str,
        is_correct: bool,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn create_assignment(&self, assignment: &AssignedTask) -> anyhow::Result<()>;

    async fn find_assignment(&self, id: &str) -> anyhow::Result<Option<AssignedTask>>;

    /// The pending assignment of `task_id` to `user_id`, or else the most recent one.
    async fn find_user_assignment(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<AssignedTask>>;

    async fn user_assignments(&self, user_id: &str) -> anyhow::Result<Vec<AssignedTask>>;

    /// pending → solved, only if still pending and `now <= due_date`.
    async fn solve_assignment(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// pending → expired for every pending assignment with `due_date < now`.
    async fn expire_overdue_assignments(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}
