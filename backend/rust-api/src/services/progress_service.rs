use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};

use super::answer_checker::check_tokens;
use super::assignment_service::AssignmentService;
use crate::error::{AppError, AppResult};
use crate::metrics::{ATTEMPTS_TOTAL, EXERCISE_ANSWERS_TOTAL};
use crate::models::progress::{
    AttemptView, ExerciseAnswerResponse, StartAttemptRequest, SubmitExerciseAnswerRequest,
    UpdateCorrectAnswersRequest,
};
use crate::models::{
    AssignmentStatus, ExerciseProgress, Task, TaskProgress, TimeConstraint,
};
use crate::store::ProgressStore;
use crate::utils::time::to_millis_precision;

const START_SLOT_RETRIES: usize = 3;

/// Who is asking. Staff (teachers, admins) may read any attempt.
#[derive(Debug, Clone, Copy)]
pub struct Actor<'a> {
    pub user_id: &'a str,
    pub is_staff: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub attempt: TaskProgress,
    /// False when the attempt had already been finalized.
    pub newly_finalized: bool,
}

pub struct ProgressService {
    store: Arc<dyn ProgressStore>,
}

impl ProgressService {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    pub async fn start_attempt(
        &self,
        user_id: &str,
        req: StartAttemptRequest,
    ) -> AppResult<AttemptView> {
        let task = self.load_task(&req.task_id).await?;
        let budget = time_budget(&task)?;
        let now = to_millis_precision(Utc::now());

        if let Some(assignment_id) = &req.assignment_id {
            let assignment = self
                .store
                .find_assignment(assignment_id)
                .await?
                .ok_or(AppError::NotFound("assignment"))?;
            if assignment.user_id != user_id {
                return Err(AppError::Forbidden(
                    "assignment belongs to another user".to_string(),
                ));
            }
            if assignment.task_id != task.id {
                return Err(AppError::BadRequest(
                    "assignment is for a different task".to_string(),
                ));
            }
            if assignment.status != AssignmentStatus::Pending || assignment.is_overdue(now) {
                return Err(AppError::Conflict(format!(
                    "assignment is no longer open ({})",
                    assignment.status.as_str()
                )));
            }
        }

        let exercises = self.store.task_exercises(&task.id).await?;
        let needed = task.exercises_number as usize;
        if exercises.len() < needed {
            return Err(AppError::Conflict(format!(
                "task has {} exercises attached, {} required",
                exercises.len(),
                needed
            )));
        }

        // The next attempt takes slot `tries_used + 1`. Losing that slot to a
        // concurrent start means the count moved, so count again.
        let mut created = None;
        for _ in 0..START_SLOT_RETRIES {
            let tries_used = self.store.count_attempts(user_id, &task.id).await?;
            if !task.allows_another_try(tries_used) {
                return Err(AppError::Conflict(format!(
                    "attempt limit of {} reached",
                    task.tries_number
                )));
            }
            let attempt_number = u32::try_from(tries_used + 1)
                .map_err(|_| AppError::Conflict("too many attempts".to_string()))?;

            let attempt = TaskProgress::start(user_id, &task.id, req.assignment_id.clone(), now)
                .numbered(attempt_number);
            let rows: Vec<ExerciseProgress> = exercises
                .iter()
                .take(needed)
                .enumerate()
                .map(|(position, exercise)| {
                    ExerciseProgress::placeholder(&attempt, &exercise.id, position as u32)
                })
                .collect();

            if self.store.create_attempt(&attempt, &rows).await? {
                created = Some((attempt, rows));
                break;
            }
            tracing::debug!(user_id, task_id = %task.id, attempt_number, "Attempt slot taken, recounting");
        }
        let Some((attempt, rows)) = created else {
            return Err(AppError::Conflict(
                "another attempt at this task was started concurrently".to_string(),
            ));
        };
        ATTEMPTS_TOTAL.with_label_values(&["started"]).inc();

        tracing::info!(
            task_progress_id = %attempt.id,
            task_id = %task.id,
            user_id,
            exercises = rows.len(),
            time_constraint = %budget,
            "Task attempt started"
        );

        Ok(build_view(attempt, &task, budget, rows, now))
    }

    pub async fn get_attempt(&self, id: &str, actor: Actor<'_>) -> AppResult<AttemptView> {
        let attempt = self.load_attempt(id, actor, false).await?;
        self.view(attempt).await
    }

    pub async fn update_correct_answers(
        &self,
        id: &str,
        actor: Actor<'_>,
        req: UpdateCorrectAnswersRequest,
    ) -> AppResult<AttemptView> {
        let attempt = self.load_attempt(id, actor, true).await?;
        if !attempt.is_active {
            return Err(AppError::Conflict("attempt is already finished".to_string()));
        }

        let task = self.load_task(&attempt.task_id).await?;
        if req.correct_answers > task.exercises_number {
            return Err(AppError::BadRequest(format!(
                "correct_answers cannot exceed {}",
                task.exercises_number
            )));
        }

        if !self
            .store
            .set_correct_answers(&attempt.id, req.correct_answers)
            .await?
        {
            return Err(AppError::Conflict("attempt is already finished".to_string()));
        }

        let updated = self.reload(&attempt.id).await?;
        self.view(updated).await
    }

    /// Client-triggered finalization. Calling it again returns the same attempt.
    pub async fn finish_attempt(&self, id: &str, actor: Actor<'_>) -> AppResult<AttemptView> {
        let attempt = self.load_attempt(id, actor, true).await?;
        let outcome = self.finalize_attempt(&attempt, Utc::now()).await?;
        self.view(outcome.attempt).await
    }

    /// Finalizes the attempt if still active and settles its assignment.
    ///
    /// The store update is conditional on `is_active`, so concurrent callers
    /// (client timer, countdown stream, sweeper) cannot finalize twice.
    pub async fn finalize_attempt(
        &self,
        attempt: &TaskProgress,
        now: DateTime<Utc>,
    ) -> anyhow::Result<FinalizeOutcome> {
        let newly_finalized = self
            .store
            .finalize_attempt(&attempt.id, to_millis_precision(now))
            .await?;

        let current = self
            .store
            .find_attempt(&attempt.id)
            .await?
            .with_context(|| format!("task_progress {} disappeared", attempt.id))?;

        if newly_finalized {
            ATTEMPTS_TOTAL.with_label_values(&["finalized"]).inc();
            tracing::info!(
                task_progress_id = %current.id,
                correct_answers = current.correct_answers,
                "Task attempt finalized"
            );
        }

        // Judged by the stored completion time, so retries agree with the first call.
        if let (Some(assignment_id), Some(completed_at)) =
            (&current.assignment_id, current.completed_at)
        {
            AssignmentService::new(self.store.clone())
                .solve(assignment_id, completed_at)
                .await?;
        }

        Ok(FinalizeOutcome {
            attempt: current,
            newly_finalized,
        })
    }

    pub async fn submit_answer(
        &self,
        exercise_progress_id: &str,
        actor: Actor<'_>,
        req: SubmitExerciseAnswerRequest,
    ) -> AppResult<ExerciseAnswerResponse> {
        let row = self
            .store
            .find_exercise_progress(exercise_progress_id)
            .await?
            .ok_or(AppError::NotFound("exercise progress"))?;
        if row.user_id != actor.user_id {
            return Err(AppError::Forbidden(
                "exercise progress belongs to another user".to_string(),
            ));
        }

        let attempt = self.reload(&row.task_progress_id).await?;
        if !attempt.is_active {
            return Err(AppError::Conflict("attempt is already finished".to_string()));
        }

        let task = self.load_task(&attempt.task_id).await?;
        let budget = time_budget(&task)?;
        let now = to_millis_precision(Utc::now());
        if budget.is_expired(attempt.started_at, now) {
            self.finalize_attempt(&attempt, now).await?;
            return Err(AppError::Conflict("time is up for this attempt".to_string()));
        }

        if row.is_answered() {
            return Err(AppError::Conflict("exercise already answered".to_string()));
        }

        let exercise = self
            .store
            .find_exercise(&row.exercise_id)
            .await?
            .ok_or(AppError::NotFound("exercise"))?;
        let verdict = check_tokens(&req.words, &exercise.correct_sentence);

        if !self
            .store
            .record_answer(&row.id, &verdict.answer, verdict.is_correct, now)
            .await?
        {
            return Err(AppError::Conflict("exercise already answered".to_string()));
        }
        EXERCISE_ANSWERS_TOTAL
            .with_label_values(&[if verdict.is_correct { "true" } else { "false" }])
            .inc();

        if verdict.is_correct && !self.store.increment_correct_answers(&attempt.id).await? {
            tracing::warn!(
                task_progress_id = %attempt.id,
                "Attempt finished before the correct answer was counted"
            );
        }

        tracing::info!(
            exercise_progress_id = %row.id,
            task_progress_id = %attempt.id,
            correct = verdict.is_correct,
            "Exercise answer recorded"
        );

        let updated_row = self
            .store
            .find_exercise_progress(&row.id)
            .await?
            .ok_or(AppError::NotFound("exercise progress"))?;
        let updated_attempt = self.reload(&attempt.id).await?;

        Ok(ExerciseAnswerResponse {
            exercise_progress: updated_row,
            correct_sentence: exercise.correct_sentence,
            explanation: exercise.explanation,
            correct_answers: updated_attempt.correct_answers,
        })
    }

    /// Attempt plus its time budget, for the countdown stream.
    pub async fn countdown_target(
        &self,
        id: &str,
        actor: Actor<'_>,
    ) -> AppResult<(TaskProgress, TimeConstraint)> {
        let attempt = self.load_attempt(id, actor, false).await?;
        let task = self.load_task(&attempt.task_id).await?;
        Ok((attempt, time_budget(&task)?))
    }

    pub async fn find_attempt(&self, id: &str) -> anyhow::Result<Option<TaskProgress>> {
        self.store.find_attempt(id).await
    }

    async fn view(&self, attempt: TaskProgress) -> AppResult<AttemptView> {
        let task = self.load_task(&attempt.task_id).await?;
        let budget = time_budget(&task)?;
        let rows = self.store.attempt_exercises(&attempt.id).await?;
        Ok(build_view(attempt, &task, budget, rows, Utc::now()))
    }

    async fn load_task(&self, task_id: &str) -> AppResult<Task> {
        self.store
            .find_task(task_id)
            .await?
            .ok_or(AppError::NotFound("task"))
    }

    async fn reload(&self, id: &str) -> AppResult<TaskProgress> {
        self.store
            .find_attempt(id)
            .await?
            .ok_or(AppError::NotFound("task progress"))
    }

    async fn load_attempt(
        &self,
        id: &str,
        actor: Actor<'_>,
        owner_only: bool,
    ) -> AppResult<TaskProgress> {
        let attempt = self.reload(id).await?;
        let allowed = attempt.user_id == actor.user_id || (!owner_only && actor.is_staff);
        if !allowed {
            return Err(AppError::Forbidden(
                "task progress belongs to another user".to_string(),
            ));
        }
        Ok(attempt)
    }
}

fn time_budget(task: &Task) -> AppResult<TimeConstraint> {
    task.time_budget()
        .with_context(|| format!("task {} has an invalid time_constraint", task.id))
        .map_err(AppError::Internal)
}

fn build_view(
    attempt: TaskProgress,
    task: &Task,
    budget: TimeConstraint,
    exercises: Vec<ExerciseProgress>,
    now: DateTime<Utc>,
) -> AttemptView {
    let deadline = budget.deadline(attempt.started_at);
    let remaining_ms = if attempt.is_active {
        budget
            .remaining(attempt.started_at, now)
            .map(|left| left.num_milliseconds())
    } else {
        budget.duration_ms().map(|_| 0)
    };

    AttemptView {
        time_constraint: task.time_constraint.clone(),
        deadline,
        remaining_ms,
        exercises,
        progress: attempt,
    }
}
