use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::metrics::ASSIGNMENT_TRANSITIONS_TOTAL;
use crate::models::assignment::CreateAssignmentRequest;
use crate::models::{AssignedTask, AssignmentStatus};
use crate::store::ProgressStore;

pub struct AssignmentService {
    store: Arc<dyn ProgressStore>,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    pub async fn create_assignment(
        &self,
        assigned_by: &str,
        req: CreateAssignmentRequest,
    ) -> AppResult<AssignedTask> {
        let now = Utc::now();
        if req.due_date <= now {
            return Err(AppError::BadRequest(
                "due_date must be in the future".to_string(),
            ));
        }

        self.store
            .find_task(&req.task_id)
            .await?
            .ok_or(AppError::NotFound("task"))?;

        let assignment = AssignedTask {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: req.user_id,
            task_id: req.task_id,
            assigned_by: assigned_by.to_string(),
            due_date: req.due_date,
            assigned_at: now,
            status: AssignmentStatus::Pending,
        };
        self.store.create_assignment(&assignment).await?;
        ASSIGNMENT_TRANSITIONS_TOTAL
            .with_label_values(&[AssignmentStatus::Pending.as_str()])
            .inc();

        tracing::info!(
            assignment_id = %assignment.id,
            task_id = %assignment.task_id,
            user_id = %assignment.user_id,
            "Task assigned"
        );
        Ok(assignment)
    }

    pub async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<AssignedTask>> {
        Ok(self.store.user_assignments(user_id).await?)
    }

    /// Marks the caller's assignment of `task_id` solved.
    ///
    /// Only a finalized attempt at the task completed by the due date counts;
    /// the assignment is judged at that attempt's `completed_at`. Solving an
    /// already solved assignment returns it unchanged.
    pub async fn mark_solved(&self, user_id: &str, task_id: &str) -> AppResult<AssignedTask> {
        let assignment = self
            .store
            .find_user_assignment(user_id, task_id)
            .await?
            .ok_or(AppError::NotFound("assignment"))?;

        match assignment.status {
            AssignmentStatus::Solved => return Ok(assignment),
            AssignmentStatus::Expired => {
                return Err(AppError::Conflict("assignment has expired".to_string()))
            }
            AssignmentStatus::Pending => {}
        }

        let completed_at = self
            .store
            .first_completed_attempt(user_id, task_id)
            .await?
            .and_then(|attempt| attempt.completed_at)
            .ok_or_else(|| {
                AppError::Conflict("no finished attempt at this task".to_string())
            })?;
        if completed_at > assignment.due_date {
            return Err(AppError::Conflict(
                "task was finished after the due date".to_string(),
            ));
        }

        self.solve(&assignment.id, completed_at).await?;

        // Re-read: a concurrent sweep may have won the race.
        let current = self
            .store
            .find_assignment(&assignment.id)
            .await?
            .ok_or(AppError::NotFound("assignment"))?;
        match current.status {
            AssignmentStatus::Solved => Ok(current),
            _ => Err(AppError::Conflict(format!(
                "assignment is {}",
                current.status.as_str()
            ))),
        }
    }

    /// pending → solved if the assignment was still open at `completed_at`.
    pub async fn solve(
        &self,
        assignment_id: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let solved = self.store.solve_assignment(assignment_id, completed_at).await?;
        if solved {
            ASSIGNMENT_TRANSITIONS_TOTAL
                .with_label_values(&[AssignmentStatus::Solved.as_str()])
                .inc();
            tracing::info!(assignment_id, "Assignment solved");
        }
        Ok(solved)
    }

    /// pending → expired for everything past its due date.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let expired = self.store.expire_overdue_assignments(now).await?;
        if expired > 0 {
            ASSIGNMENT_TRANSITIONS_TOTAL
                .with_label_values(&[AssignmentStatus::Expired.as_str()])
                .inc_by(expired);
            tracing::info!(expired, "Expired overdue assignments");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskProgress};
    use crate::store::InMemoryStore;
    use chrono::Duration;

    fn store_with_task() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_task(Task {
                id: "t1".into(),
                name: "Past simple".into(),
                created_by: "teacher".into(),
                tries_number: 0,
                exercises_number: 0,
                time_constraint: "00:00:00".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
    }

    fn assignment(status: AssignmentStatus, due_in: Duration) -> AssignedTask {
        let now = Utc::now();
        AssignedTask {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "s1".into(),
            task_id: "t1".into(),
            assigned_by: "teacher".into(),
            due_date: now + due_in,
            assigned_at: now,
            status,
        }
    }

    #[tokio::test]
    async fn create_requires_future_due_date_and_known_task() {
        let service = AssignmentService::new(store_with_task());

        let past = CreateAssignmentRequest {
            user_id: "s1".into(),
            task_id: "t1".into(),
            due_date: Utc::now() - Duration::minutes(1),
        };
        assert!(matches!(
            service.create_assignment("teacher", past).await,
            Err(AppError::BadRequest(_))
        ));

        let unknown = CreateAssignmentRequest {
            user_id: "s1".into(),
            task_id: "missing".into(),
            due_date: Utc::now() + Duration::days(1),
        };
        assert!(matches!(
            service.create_assignment("teacher", unknown).await,
            Err(AppError::NotFound("task"))
        ));

        let ok = CreateAssignmentRequest {
            user_id: "s1".into(),
            task_id: "t1".into(),
            due_date: Utc::now() + Duration::days(1),
        };
        let created = service.create_assignment("teacher", ok).await.unwrap();
        assert_eq!(created.status, AssignmentStatus::Pending);
        assert_eq!(created.assigned_by, "teacher");
    }

    #[tokio::test]
    async fn overdue_pending_assignments_expire() {
        let store = store_with_task();
        let overdue = assignment(AssignmentStatus::Pending, Duration::seconds(-1));
        let open = assignment(AssignmentStatus::Pending, Duration::hours(1));
        let solved = assignment(AssignmentStatus::Solved, Duration::seconds(-1));
        for a in [&overdue, &open, &solved] {
            store.create_assignment(a).await.unwrap();
        }

        let service = AssignmentService::new(store.clone());
        assert_eq!(service.expire_overdue(Utc::now()).await.unwrap(), 1);

        let status = |id: String| {
            let store = store.clone();
            async move { store.find_assignment(&id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(overdue.id).await, AssignmentStatus::Expired);
        assert_eq!(status(open.id).await, AssignmentStatus::Pending);
        assert_eq!(status(solved.id).await, AssignmentStatus::Solved);
    }

    fn finished_attempt(user_id: &str, completed_at: DateTime<Utc>) -> TaskProgress {
        let mut attempt =
            TaskProgress::start(user_id, "t1", None, completed_at - Duration::minutes(5));
        attempt.is_active = false;
        attempt.completed_at = Some(completed_at);
        attempt
    }

    #[tokio::test]
    async fn mark_solved_requires_a_finished_attempt() {
        let store = store_with_task();
        let service = AssignmentService::new(store.clone());
        let open = assignment(AssignmentStatus::Pending, Duration::hours(1));
        store.create_assignment(&open).await.unwrap();

        assert!(matches!(
            service.mark_solved("s1", "t1").await,
            Err(AppError::Conflict(_))
        ));
        store
            .put_attempt(TaskProgress::start("s1", "t1", None, Utc::now()))
            .unwrap();
        assert!(matches!(
            service.mark_solved("s1", "t1").await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(
            store.find_assignment(&open.id).await.unwrap().unwrap().status,
            AssignmentStatus::Pending
        );

        store
            .put_attempt(finished_attempt("s1", Utc::now()).numbered(2))
            .unwrap();
        let solved = service.mark_solved("s1", "t1").await.unwrap();
        assert_eq!(solved.status, AssignmentStatus::Solved);
        let again = service.mark_solved("s1", "t1").await.unwrap();
        assert_eq!(again.status, AssignmentStatus::Solved);
    }

    #[tokio::test]
    async fn mark_solved_refuses_late_or_expired_work() {
        let store = store_with_task();
        let service = AssignmentService::new(store.clone());

        let open = assignment(AssignmentStatus::Pending, Duration::hours(1));
        store.create_assignment(&open).await.unwrap();
        store
            .put_attempt(finished_attempt("s1", open.due_date + Duration::minutes(1)))
            .unwrap();
        assert!(matches!(
            service.mark_solved("s1", "t1").await,
            Err(AppError::Conflict(_))
        ));

        let mut expired = assignment(AssignmentStatus::Expired, Duration::hours(-1));
        expired.user_id = "s2".into();
        store.create_assignment(&expired).await.unwrap();
        store.put_attempt(finished_attempt("s2", Utc::now())).unwrap();
        assert!(matches!(
            service.mark_solved("s2", "t1").await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            service.mark_solved("nobody", "t1").await,
            Err(AppError::NotFound("assignment"))
        ));
    }

    #[tokio::test]
    async fn finished_in_time_counts_even_after_the_due_date() {
        let store = store_with_task();
        let service = AssignmentService::new(store.clone());
        let mut overdue = assignment(AssignmentStatus::Pending, Duration::minutes(-1));
        overdue.assigned_at = Utc::now() - Duration::days(1);
        store.create_assignment(&overdue).await.unwrap();
        store
            .put_attempt(finished_attempt("s1", overdue.due_date - Duration::minutes(10)))
            .unwrap();

        let solved = service.mark_solved("s1", "t1").await.unwrap();
        assert_eq!(solved.status, AssignmentStatus::Solved);
    }
}
