use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use super::{
    ProgressStore, ASSIGNED_TASKS, EXERCISES, EXERCISE_PROGRESS, TASKS, TASK_PROGRESS,
};
use crate::metrics::track_db_operation;
use crate::models::{
    AssignedTask, AssignmentStatus, Exercise, ExerciseProgress, Task, TaskProgress,
};
use crate::utils::time::{bson_to_chrono, chrono_to_bson};

const DUPLICATE_KEY: i32 = 11000;

/// A concurrent insert already holds the unique key: either a duplicate key
/// error or a transaction write conflict on the same index entry.
fn lost_insert_race(err: &mongodb::error::Error) -> bool {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        return true;
    }
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    created_by: String,
    tries_number: i64,
    exercises_number: i64,
    time_constraint: String,
    created_at: BsonDateTime,
}

impl TryFrom<TaskDocument> for Task {
    type Error = anyhow::Error;

    fn try_from(d: TaskDocument) -> Result<Self> {
        Ok(Task {
            tries_number: u32::try_from(d.tries_number)
                .with_context(|| format!("task {} has invalid tries_number", d.id))?,
            exercises_number: u32::try_from(d.exercises_number)
                .with_context(|| format!("task {} has invalid exercises_number", d.id))?,
            id: d.id,
            name: d.name,
            created_by: d.created_by,
            time_constraint: d.time_constraint,
            created_at: bson_to_chrono(d.created_at),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExerciseDocument {
    #[serde(rename = "_id")]
    id: String,
    translation: String,
    correct_sentence: String,
    words: Vec<String>,
    explanation: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    task_id: Option<String>,
    created_by: String,
    created_at: BsonDateTime,
}

impl From<ExerciseDocument> for Exercise {
    fn from(d: ExerciseDocument) -> Self {
        Exercise {
            id: d.id,
            translation: d.translation,
            correct_sentence: d.correct_sentence,
            words: d.words,
            explanation: d.explanation,
            tags: d.tags,
            task_id: d.task_id,
            created_by: d.created_by,
            created_at: bson_to_chrono(d.created_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskProgressDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    task_id: String,
    correct_answers: i64,
    started_at: BsonDateTime,
    completed_at: Option<BsonDateTime>,
    is_active: bool,
    #[serde(default)]
    assignment_id: Option<String>,
    #[serde(default)]
    attempt_number: i64,
}

impl From<&TaskProgress> for TaskProgressDocument {
    fn from(p: &TaskProgress) -> Self {
        Self {
            id: p.id.clone(),
            user_id: p.user_id.clone(),
            task_id: p.task_id.clone(),
            correct_answers: i64::from(p.correct_answers),
            started_at: chrono_to_bson(p.started_at),
            completed_at: p.completed_at.map(chrono_to_bson),
            is_active: p.is_active,
            assignment_id: p.assignment_id.clone(),
            attempt_number: i64::from(p.attempt_number),
        }
    }
}

impl From<TaskProgressDocument> for TaskProgress {
    fn from(d: TaskProgressDocument) -> Self {
        TaskProgress {
            id: d.id,
            user_id: d.user_id,
            task_id: d.task_id,
            correct_answers: u32::try_from(d.correct_answers.max(0)).unwrap_or(u32::MAX),
            started_at: bson_to_chrono(d.started_at),
            completed_at: d.completed_at.map(bson_to_chrono),
            is_active: d.is_active,
            assignment_id: d.assignment_id,
            attempt_number: u32::try_from(d.attempt_number.max(0)).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExerciseProgressDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    exercise_id: String,
    task_progress_id: String,
    position: i64,
    user_answer: Option<String>,
    is_correct: bool,
    completed_at: Option<BsonDateTime>,
}

impl From<&ExerciseProgress> for ExerciseProgressDocument {
    fn from(p: &ExerciseProgress) -> Self {
        Self {
            id: p.id.clone(),
            user_id: p.user_id.clone(),
            exercise_id: p.exercise_id.clone(),
            task_progress_id: p.task_progress_id.clone(),
            position: i64::from(p.position),
            user_answer: p.user_answer.clone(),
            is_correct: p.is_correct,
            completed_at: p.completed_at.map(chrono_to_bson),
        }
    }
}

impl From<ExerciseProgressDocument> for ExerciseProgress {
    fn from(d: ExerciseProgressDocument) -> Self {
        ExerciseProgress {
            id: d.id,
            user_id: d.user_id,
            exercise_id: d.exercise_id,
            task_progress_id: d.task_progress_id,
            position: u32::try_from(d.position.max(0)).unwrap_or(u32::MAX),
            user_answer: d.user_answer,
            is_correct: d.is_correct,
            completed_at: d.completed_at.map(bson_to_chrono),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssignedTaskDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    task_id: String,
    assigned_by: String,
    due_date: BsonDateTime,
    assigned_at: BsonDateTime,
    status: AssignmentStatus,
}

impl From<&AssignedTask> for AssignedTaskDocument {
    fn from(a: &AssignedTask) -> Self {
        Self {
            id: a.id.clone(),
            user_id: a.user_id.clone(),
            task_id: a.task_id.clone(),
            assigned_by: a.assigned_by.clone(),
            due_date: chrono_to_bson(a.due_date),
            assigned_at: chrono_to_bson(a.assigned_at),
            status: a.status,
        }
    }
}

impl From<AssignedTaskDocument> for AssignedTask {
    fn from(d: AssignedTaskDocument) -> Self {
        AssignedTask {
            id: d.id,
            user_id: d.user_id,
            task_id: d.task_id,
            assigned_by: d.assigned_by,
            due_date: bson_to_chrono(d.due_date),
            assigned_at: bson_to_chrono(d.assigned_at),
            status: d.status,
        }
    }
}

/// MongoDB-backed store. Requires a replica set for attempt creation,
/// which runs inside a multi-document transaction.
#[derive(Clone)]
pub struct MongoStore {
    mongo: Database,
}

impl MongoStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    pub fn mongo(&self) -> &Database {
        &self.mongo
    }

    fn tasks(&self) -> Collection<TaskDocument> {
        self.mongo.collection(TASKS)
    }

    fn exercises(&self) -> Collection<ExerciseDocument> {
        self.mongo.collection(EXERCISES)
    }

    fn attempts(&self) -> Collection<TaskProgressDocument> {
        self.mongo.collection(TASK_PROGRESS)
    }

    fn exercise_rows(&self) -> Collection<ExerciseProgressDocument> {
        self.mongo.collection(EXERCISE_PROGRESS)
    }

    fn assignments(&self) -> Collection<AssignedTaskDocument> {
        self.mongo.collection(ASSIGNED_TASKS)
    }

    /// Indexes backing the sweeper and lookup queries. Safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> Result<()> {
        use mongodb::options::IndexOptions;
        use mongodb::IndexModel;

        self.attempts()
            .create_indexes([
                IndexModel::builder().keys(doc! { "is_active": 1 }).build(),
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "task_id": 1, "attempt_number": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .partial_filter_expression(doc! { "attempt_number": { "$gt": 0 } })
                            .build(),
                    )
                    .build(),
            ])
            .await
            .context("Failed to create task_progress indexes")?;
        self.exercise_rows()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "task_progress_id": 1, "position": 1 })
                    .build(),
            )
            .await
            .context("Failed to create exercise_progress index")?;
        self.assignments()
            .create_indexes([
                IndexModel::builder()
                    .keys(doc! { "status": 1, "due_date": 1 })
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "task_id": 1 })
                    .build(),
            ])
            .await
            .context("Failed to create assigned_tasks indexes")?;
        self.exercises()
            .create_index(IndexModel::builder().keys(doc! { "task_id": 1 }).build())
            .await
            .context("Failed to create exercises index")?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.mongo
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let found = track_db_operation("find_one", TASKS, async {
            self.tasks()
                .find_one(doc! { "_id": task_id })
                .await
                .context("Failed to query task")
        })
        .await?;
        found.map(Task::try_from).transpose()
    }

    async fn task_exercises(&self, task_id: &str) -> Result<Vec<Exercise>> {
        let docs: Vec<ExerciseDocument> = track_db_operation("find", EXERCISES, async {
            self.exercises()
                .find(doc! { "task_id": task_id })
                .sort(doc! { "created_at": 1, "_id": 1 })
                .await
                .context("Failed to query task exercises")?
                .try_collect()
                .await
                .context("Failed to read task exercises")
        })
        .await?;
        Ok(docs.into_iter().map(Exercise::from).collect())
    }

    async fn find_exercise(&self, exercise_id: &str) -> Result<Option<Exercise>> {
        let found = track_db_operation("find_one", EXERCISES, async {
            self.exercises()
                .find_one(doc! { "_id": exercise_id })
                .await
                .context("Failed to query exercise")
        })
        .await?;
        Ok(found.map(Exercise::from))
    }

    async fn count_attempts(&self, user_id: &str, task_id: &str) -> Result<u64> {
        track_db_operation("count", TASK_PROGRESS, async {
            self.attempts()
                .count_documents(doc! { "user_id": user_id, "task_id": task_id })
                .await
                .context("Failed to count attempts")
        })
        .await
    }

    async fn create_attempt(
        &self,
        attempt: &TaskProgress,
        rows: &[ExerciseProgress],
    ) -> Result<bool> {
        let attempt_doc = TaskProgressDocument::from(attempt);
        let row_docs: Vec<ExerciseProgressDocument> =
            rows.iter().map(ExerciseProgressDocument::from).collect();

        track_db_operation("transaction", TASK_PROGRESS, async {
            let mut session = self
                .mongo
                .client()
                .start_session()
                .await
                .context("Failed to start MongoDB session")?;
            session
                .start_transaction()
                .await
                .context("Failed to start transaction")?;

            // The unique (user_id, task_id, attempt_number) index rejects a
            // second insert into the same slot; dropping the session aborts.
            match self
                .attempts()
                .insert_one(&attempt_doc)
                .session(&mut session)
                .await
            {
                Ok(_) => {}
                Err(err) if lost_insert_race(&err) => return Ok(false),
                Err(err) => return Err(err).context("Failed to insert task_progress"),
            }

            if !row_docs.is_empty() {
                self.exercise_rows()
                    .insert_many(&row_docs)
                    .session(&mut session)
                    .await
                    .context("Failed to insert exercise_progress rows")?;
            }

            match session.commit_transaction().await {
                Ok(()) => Ok(true),
                Err(err) if lost_insert_race(&err) => Ok(false),
                Err(err) => Err(err).context("Failed to commit attempt transaction"),
            }
        })
        .await
    }

    async fn find_attempt(&self, id: &str) -> Result<Option<TaskProgress>> {
        let found = track_db_operation("find_one", TASK_PROGRESS, async {
            self.attempts()
                .find_one(doc! { "_id": id })
                .await
                .context("Failed to query task_progress")
        })
        .await?;
        Ok(found.map(TaskProgress::from))
    }

    async fn active_attempts(&self) -> Result<Vec<TaskProgress>> {
        let docs: Vec<TaskProgressDocument> = track_db_operation("find", TASK_PROGRESS, async {
            self.attempts()
                .find(doc! { "is_active": true })
                .await
                .context("Failed to query active attempts")?
                .try_collect()
                .await
                .context("Failed to read active attempts")
        })
        .await?;
        Ok(docs.into_iter().map(TaskProgress::from).collect())
    }

    async fn first_completed_attempt(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskProgress>> {
        let found = track_db_operation("find_one", TASK_PROGRESS, async {
            self.attempts()
                .find_one(doc! {
                    "user_id": user_id,
                    "task_id": task_id,
                    "is_active": false,
                    "completed_at": { "$ne": null },
                })
                .sort(doc! { "completed_at": 1 })
                .await
                .context("Failed to query completed attempts")
        })
        .await?;
        Ok(found.map(TaskProgress::from))
    }

    async fn set_correct_answers(&self, id: &str, correct_answers: u32) -> Result<bool> {
        let result = track_db_operation("update_one", TASK_PROGRESS, async {
            self.attempts()
                .update_one(
                    doc! { "_id": id, "is_active": true },
                    doc! { "$set": { "correct_answers": i64::from(correct_answers) } },
                )
                .await
                .context("Failed to update correct_answers")
        })
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn increment_correct_answers(&self, id: &str) -> Result<bool> {
        let result = track_db_operation("update_one", TASK_PROGRESS, async {
            self.attempts()
                .update_one(
                    doc! { "_id": id, "is_active": true },
                    doc! { "$inc": { "correct_answers": 1_i64 } },
                )
                .await
                .context("Failed to increment correct_answers")
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn finalize_attempt(&self, id: &str, completed_at: DateTime<Utc>) -> Result<bool> {
        let result = track_db_operation("update_one", TASK_PROGRESS, async {
            self.attempts()
                .update_one(
                    doc! { "_id": id, "is_active": true },
                    doc! { "$set": {
                        "is_active": false,
                        "completed_at": chrono_to_bson(completed_at),
                    } },
                )
                .await
                .context("Failed to finalize attempt")
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn attempt_exercises(&self, task_progress_id: &str) -> Result<Vec<ExerciseProgress>> {
        let docs: Vec<ExerciseProgressDocument> =
            track_db_operation("find", EXERCISE_PROGRESS, async {
                self.exercise_rows()
                    .find(doc! { "task_progress_id": task_progress_id })
                    .sort(doc! { "position": 1 })
                    .await
                    .context("Failed to query exercise_progress")?
                    .try_collect()
                    .await
                    .context("Failed to read exercise_progress")
            })
            .await?;
        Ok(docs.into_iter().map(ExerciseProgress::from).collect())
    }

    async fn find_exercise_progress(&self, id: &str) -> Result<Option<ExerciseProgress>> {
        let found = track_db_operation("find_one", EXERCISE_PROGRESS, async {
            self.exercise_rows()
                .find_one(doc! { "_id": id })
                .await
                .context("Failed to query exercise_progress")
        })
        .await?;
        Ok(found.map(ExerciseProgress::from))
    }

    async fn record_answer(
        &self,
        id: &str,
        answer: &str,
        is_correct: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = track_db_operation("update_one", EXERCISE_PROGRESS, async {
            self.exercise_rows()
                .update_one(
                    doc! { "_id": id, "user_answer": null },
                    doc! { "$set": {
                        "user_answer": answer,
                        "is_correct": is_correct,
                        "completed_at": chrono_to_bson(completed_at),
                    } },
                )
                .await
                .context("Failed to record exercise answer")
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn create_assignment(&self, assignment: &AssignedTask) -> Result<()> {
        let document = AssignedTaskDocument::from(assignment);
        track_db_operation("insert_one", ASSIGNED_TASKS, async {
            self.assignments()
                .insert_one(&document)
                .await
                .context("Failed to insert assignment")
        })
        .await?;
        Ok(())
    }

    async fn find_assignment(&self, id: &str) -> Result<Option<AssignedTask>> {
        let found = track_db_operation("find_one", ASSIGNED_TASKS, async {
            self.assignments()
                .find_one(doc! { "_id": id })
                .await
                .context("Failed to query assignment")
        })
        .await?;
        Ok(found.map(AssignedTask::from))
    }

    async fn find_user_assignment(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<AssignedTask>> {
        let found = track_db_operation("find_one", ASSIGNED_TASKS, async {
            let pending = self
                .assignments()
                .find_one(doc! {
                    "user_id": user_id,
                    "task_id": task_id,
                    "status": AssignmentStatus::Pending.as_str(),
                })
                .sort(doc! { "assigned_at": -1 })
                .await
                .context("Failed to query pending assignment")?;
            if pending.is_some() {
                return Ok(pending);
            }
            self.assignments()
                .find_one(doc! { "user_id": user_id, "task_id": task_id })
                .sort(doc! { "assigned_at": -1 })
                .await
                .context("Failed to query assignment")
        })
        .await?;
        Ok(found.map(AssignedTask::from))
    }

    async fn user_assignments(&self, user_id: &str) -> Result<Vec<AssignedTask>> {
        let docs: Vec<AssignedTaskDocument> = track_db_operation("find", ASSIGNED_TASKS, async {
            self.assignments()
                .find(doc! { "user_id": user_id })
                .sort(doc! { "due_date": 1 })
                .await
                .context("Failed to query assignments")?
                .try_collect()
                .await
                .context("Failed to read assignments")
        })
        .await?;
        Ok(docs.into_iter().map(AssignedTask::from).collect())
    }

    async fn solve_assignment(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = track_db_operation("update_one", ASSIGNED_TASKS, async {
            self.assignments()
                .update_one(
                    doc! {
                        "_id": id,
                        "status": AssignmentStatus::Pending.as_str(),
                        "due_date": { "$gte": chrono_to_bson(now) },
                    },
                    doc! { "$set": { "status": AssignmentStatus::Solved.as_str() } },
                )
                .await
                .context("Failed to mark assignment solved")
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn expire_overdue_assignments(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = track_db_operation("update_many", ASSIGNED_TASKS, async {
            self.assignments()
                .update_many(
                    doc! {
                        "status": AssignmentStatus::Pending.as_str(),
                        "due_date": { "$lt": chrono_to_bson(now) },
                    },
                    doc! { "$set": { "status": AssignmentStatus::Expired.as_str() } },
                )
                .await
                .context("Failed to expire overdue assignments")
        })
        .await?;
        Ok(result.modified_count)
    }
}
