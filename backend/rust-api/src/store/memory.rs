use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ProgressStore;
use crate::models::{
    AssignedTask, AssignmentStatus, Exercise, ExerciseProgress, Task, TaskProgress,
};

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    exercises: HashMap<String, Exercise>,
    attempts: HashMap<String, TaskProgress>,
    exercise_rows: HashMap<String, ExerciseProgress>,
    assignments: HashMap<String, AssignedTask>,
}

/// Process-local store for development runs and tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn insert_task(&self, task: Task) -> anyhow::Result<()> {
        self.lock()?.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn insert_exercise(&self, exercise: Exercise) -> anyhow::Result<()> {
        self.lock()?
            .exercises
            .insert(exercise.id.clone(), exercise);
        Ok(())
    }

    /// Overwrites an attempt as-is; lets callers age `started_at`.
    pub fn put_attempt(&self, attempt: TaskProgress) -> anyhow::Result<()> {
        self.lock()?.attempts.insert(attempt.id.clone(), attempt);
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for InMemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.lock().map(|_| ())
    }

    async fn find_task(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    async fn task_exercises(&self, task_id: &str) -> anyhow::Result<Vec<Exercise>> {
        let mut exercises: Vec<Exercise> = self
            .lock()?
            .exercises
            .values()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        exercises.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(exercises)
    }

    async fn find_exercise(&self, exercise_id: &str) -> anyhow::Result<Option<Exercise>> {
        Ok(self.lock()?.exercises.get(exercise_id).cloned())
    }

    async fn count_attempts(&self, user_id: &str, task_id: &str) -> anyhow::Result<u64> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.task_id == task_id)
            .count() as u64)
    }

    async fn create_attempt(
        &self,
        attempt: &TaskProgress,
        rows: &[ExerciseProgress],
    ) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        if tables.attempts.contains_key(&attempt.id) {
            return Err(anyhow!("duplicate task_progress id {}", attempt.id));
        }
        let slot_taken = tables.attempts.values().any(|a| {
            a.user_id == attempt.user_id
                && a.task_id == attempt.task_id
                && a.attempt_number == attempt.attempt_number
        });
        if slot_taken {
            return Ok(false);
        }
        tables.attempts.insert(attempt.id.clone(), attempt.clone());
        for row in rows {
            tables.exercise_rows.insert(row.id.clone(), row.clone());
        }
        Ok(true)
    }

    async fn find_attempt(&self, id: &str) -> anyhow::Result<Option<TaskProgress>> {
        Ok(self.lock()?.attempts.get(id).cloned())
    }

    async fn active_attempts(&self) -> anyhow::Result<Vec<TaskProgress>> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect())
    }

    async fn first_completed_attempt(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<TaskProgress>> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.task_id == task_id && !a.is_active)
            .filter(|a| a.completed_at.is_some())
            .min_by_key(|a| a.completed_at)
            .cloned())
    }

    async fn set_correct_answers(&self, id: &str, correct_answers: u32) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.attempts.get_mut(id) {
            Some(attempt) if attempt.is_active => {
                attempt.correct_answers = correct_answers;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_correct_answers(&self, id: &str) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.attempts.get_mut(id) {
            Some(attempt) if attempt.is_active => {
                attempt.correct_answers += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_attempt(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.attempts.get_mut(id) {
            Some(attempt) if attempt.is_active => {
                attempt.is_active = false;
                attempt.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attempt_exercises(
        &self,
        task_progress_id: &str,
    ) -> anyhow::Result<Vec<ExerciseProgress>> {
        let mut rows: Vec<ExerciseProgress> = self
            .lock()?
            .exercise_rows
            .values()
            .filter(|r| r.task_progress_id == task_progress_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.position);
        Ok(rows)
    }

    async fn find_exercise_progress(&self, id: &str) -> anyhow::Result<Option<ExerciseProgress>> {
        Ok(self.lock()?.exercise_rows.get(id).cloned())
    }

    async fn record_answer(
        &self,
        id: &str,
        answer: &str,
        is_correct: bool,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.exercise_rows.get_mut(id) {
            Some(row) if row.user_answer.is_none() => {
                row.user_answer = Some(answer.to_string());
                row.is_correct = is_correct;
                row.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_assignment(&self, assignment: &AssignedTask) -> anyhow::Result<()> {
        self.lock()?
            .assignments
            .insert(assignment.id.clone(), assignment.clone());
        Ok(())
    }

    async fn find_assignment(&self, id: &str) -> anyhow::Result<Option<AssignedTask>> {
        Ok(self.lock()?.assignments.get(id).cloned())
    }

    async fn find_user_assignment(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<AssignedTask>> {
        let tables = self.lock()?;
        let mut matching: Vec<&AssignedTask> = tables
            .assignments
            .values()
            .filter(|a| a.user_id == user_id && a.task_id == task_id)
            .collect();
        matching.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        let chosen = matching
            .iter()
            .find(|a| a.status == AssignmentStatus::Pending)
            .or_else(|| matching.first())
            .map(|a| (*a).clone());
        Ok(chosen)
    }

    async fn user_assignments(&self, user_id: &str) -> anyhow::Result<Vec<AssignedTask>> {
        let mut assignments: Vec<AssignedTask> = self
            .lock()?
            .assignments
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        Ok(assignments)
    }

    async fn solve_assignment(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.assignments.get_mut(id) {
            Some(assignment) if assignment.can_be_solved_at(now) => {
                assignment.status = AssignmentStatus::Solved;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue_assignments(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut tables = self.lock()?;
        let mut expired = 0;
        for assignment in tables.assignments.values_mut() {
            if assignment.status == AssignmentStatus::Pending && assignment.is_overdue(now) {
                assignment.status = AssignmentStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attempt() -> TaskProgress {
        TaskProgress::start("u1", "t1", None, Utc::now())
    }

    #[tokio::test]
    async fn finalize_only_applies_once() {
        let store = InMemoryStore::new();
        let a = attempt();
        store.create_attempt(&a, &[]).await.unwrap();

        let first = Utc::now();
        assert!(store.finalize_attempt(&a.id, first).await.unwrap());
        assert!(!store
            .finalize_attempt(&a.id, first + Duration::seconds(5))
            .await
            .unwrap());

        let stored = store.find_attempt(&a.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.completed_at, Some(first));
    }

    #[tokio::test]
    async fn counters_freeze_after_finalize() {
        let store = InMemoryStore::new();
        let a = attempt();
        store.create_attempt(&a, &[]).await.unwrap();
        assert!(store.increment_correct_answers(&a.id).await.unwrap());
        store.finalize_attempt(&a.id, Utc::now()).await.unwrap();

        assert!(!store.increment_correct_answers(&a.id).await.unwrap());
        assert!(!store.set_correct_answers(&a.id, 9).await.unwrap());
        let stored = store.find_attempt(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.correct_answers, 1);
    }

    #[tokio::test]
    async fn answers_are_recorded_once() {
        let store = InMemoryStore::new();
        let a = attempt();
        let row = ExerciseProgress::placeholder(&a, "e1", 0);
        store.create_attempt(&a, &[row.clone()]).await.unwrap();

        let now = Utc::now();
        assert!(store.record_answer(&row.id, "I run", true, now).await.unwrap());
        assert!(!store.record_answer(&row.id, "run I", false, now).await.unwrap());

        let stored = store.find_exercise_progress(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.user_answer.as_deref(), Some("I run"));
        assert!(stored.is_correct);
    }

    #[tokio::test]
    async fn duplicate_attempt_is_rejected_without_rows() {
        let store = InMemoryStore::new();
        let a = attempt();
        store.create_attempt(&a, &[]).await.unwrap();
        let row = ExerciseProgress::placeholder(&a, "e1", 0);
        assert!(store.create_attempt(&a, &[row]).await.is_err());
        assert!(store.attempt_exercises(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attempt_number_is_unique_per_user_and_task() {
        let store = InMemoryStore::new();
        assert!(store.create_attempt(&attempt(), &[]).await.unwrap());

        let same_slot = attempt();
        let row = ExerciseProgress::placeholder(&same_slot, "e1", 0);
        assert!(!store.create_attempt(&same_slot, &[row]).await.unwrap());
        assert!(store.find_attempt(&same_slot.id).await.unwrap().is_none());
        assert!(store.attempt_exercises(&same_slot.id).await.unwrap().is_empty());

        assert!(store.create_attempt(&attempt().numbered(2), &[]).await.unwrap());
        let other_user = TaskProgress::start("u2", "t1", None, Utc::now());
        assert!(store.create_attempt(&other_user, &[]).await.unwrap());
        assert_eq!(store.count_attempts("u1", "t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn first_completed_attempt_ignores_active_ones() {
        let store = InMemoryStore::new();
        let open = attempt();
        let done = attempt().numbered(2);
        store.create_attempt(&open, &[]).await.unwrap();
        store.create_attempt(&done, &[]).await.unwrap();
        assert!(store.first_completed_attempt("u1", "t1").await.unwrap().is_none());

        let at = Utc::now();
        store.finalize_attempt(&done.id, at).await.unwrap();
        let found = store.first_completed_attempt("u1", "t1").await.unwrap().unwrap();
        assert_eq!(found.id, done.id);
        assert_eq!(found.completed_at, Some(at));
    }
}
