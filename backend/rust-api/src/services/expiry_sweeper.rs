use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::assignment_service::AssignmentService;
use super::progress_service::ProgressService;
use crate::metrics::{SWEEPER_ROW_FAILURES_TOTAL, SWEEPER_TICKS_TOTAL};
use crate::models::{TaskProgress, TimeConstraint};
use crate::store::ProgressStore;
use crate::utils::retry::{retry_async_with_config, RetryConfig};

const LEASE_KEY: &str = "sweep:lease";

/// Counts from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub finalized: usize,
    pub skipped_unlimited: usize,
    pub failed: usize,
    pub assignments_expired: u64,
}

/// Finalizes attempts whose deadline passed while nobody was watching,
/// and expires overdue assignments.
pub struct ExpirySweeper {
    store: Arc<dyn ProgressStore>,
    redis: Option<ConnectionManager>,
    interval: Duration,
    retry: RetryConfig,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        redis: Option<ConnectionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            redis,
            interval,
            retry: RetryConfig::sweep(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// One pass over all active attempts. A failing row is counted and skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let progress = ProgressService::new(self.store.clone());
        let active = self
            .store
            .active_attempts()
            .await
            .context("Failed to list active attempts")?;

        let mut report = SweepReport {
            scanned: active.len(),
            ..SweepReport::default()
        };
        let mut budgets: HashMap<String, Option<TimeConstraint>> = HashMap::new();

        for attempt in &active {
            let budget = match self.budget_for(&mut budgets, attempt).await {
                Ok(Some(budget)) => budget,
                Ok(None) => {
                    report.failed += 1;
                    SWEEPER_ROW_FAILURES_TOTAL.inc();
                    continue;
                }
                Err(err) => {
                    warn!(task_progress_id = %attempt.id, error = %err, "Failed to load task for attempt");
                    report.failed += 1;
                    SWEEPER_ROW_FAILURES_TOTAL.inc();
                    continue;
                }
            };

            if budget.is_unlimited() {
                report.skipped_unlimited += 1;
                continue;
            }
            if !budget.is_expired(attempt.started_at, now) {
                continue;
            }

            let finalized = retry_async_with_config(self.retry.clone(), "sweep_finalize", || {
                progress.finalize_attempt(attempt, now)
            })
            .await;
            match finalized {
                Ok(outcome) if outcome.newly_finalized => report.finalized += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(task_progress_id = %attempt.id, error = %err, "Failed to finalize expired attempt");
                    report.failed += 1;
                    SWEEPER_ROW_FAILURES_TOTAL.inc();
                }
            }
        }

        let assignments = AssignmentService::new(self.store.clone());
        report.assignments_expired =
            retry_async_with_config(self.retry.clone(), "sweep_expire_assignments", || {
                assignments.expire_overdue(now)
            })
            .await?;

        Ok(report)
    }

    /// `None` when the task is missing or its time constraint is malformed.
    async fn budget_for(
        &self,
        cache: &mut HashMap<String, Option<TimeConstraint>>,
        attempt: &TaskProgress,
    ) -> Result<Option<TimeConstraint>> {
        if let Some(cached) = cache.get(&attempt.task_id) {
            return Ok(*cached);
        }

        let budget = match self.store.find_task(&attempt.task_id).await? {
            Some(task) => match task.time_budget() {
                Ok(budget) => Some(budget),
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "Task has an invalid time constraint");
                    None
                }
            },
            None => {
                warn!(task_progress_id = %attempt.id, task_id = %attempt.task_id, "Attempt references a missing task");
                None
            }
        };
        cache.insert(attempt.task_id.clone(), budget);
        Ok(budget)
    }

    /// Sweeps once, unless another instance holds the lease.
    pub async fn run_once(&self) -> Result<Option<SweepReport>> {
        if !self.acquire_lease().await? {
            info!("Sweep lease held elsewhere, skipping tick");
            return Ok(None);
        }
        self.sweep(Utc::now()).await.map(Some)
    }

    async fn acquire_lease(&self) -> Result<bool> {
        let Some(redis) = &self.redis else {
            return Ok(true);
        };
        let mut conn = redis.clone();
        let lease_ms = self.interval.as_millis().max(1) as u64;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(LEASE_KEY)
            .arg(uuid::Uuid::new_v4().to_string())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .context("Failed to acquire sweep lease")?;
        Ok(acquired.is_some())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting expiry sweeper loop (interval {}s)",
            self.interval.as_secs()
        );

        loop {
            match self.run_once().await {
                Ok(Some(report)) => {
                    SWEEPER_TICKS_TOTAL.with_label_values(&["success"]).inc();
                    info!(
                        scanned = report.scanned,
                        finalized = report.finalized,
                        failed = report.failed,
                        assignments_expired = report.assignments_expired,
                        "Expiry sweep completed"
                    );
                }
                Ok(None) => {
                    SWEEPER_TICKS_TOTAL.with_label_values(&["skipped"]).inc();
                }
                Err(err) => {
                    SWEEPER_TICKS_TOTAL.with_label_values(&["error"]).inc();
                    warn!(error = %err, "Expiry sweep failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("Expiry sweeper stopping");
                    return;
                }
            }
        }
    }

    /// Runs the loop on a background task.
    pub fn spawn(self) -> SweeperHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        SweeperHandle { shutdown: tx, join }
    }
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the loop and waits for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "Expiry sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssignedTask, AssignmentStatus, Task};
    use crate::store::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    fn task(id: &str, time_constraint: &str) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            created_by: "teacher".into(),
            tries_number: 0,
            exercises_number: 0,
            time_constraint: time_constraint.into(),
            created_at: Utc::now(),
        }
    }

    fn attempt(id: &str, task_id: &str, started_at: DateTime<Utc>) -> TaskProgress {
        let mut attempt = TaskProgress::start("s1", task_id, None, started_at);
        attempt.id = id.into();
        attempt
    }

    fn sweeper(store: Arc<InMemoryStore>) -> ExpirySweeper {
        ExpirySweeper::new(store, None, Duration::from_secs(60)).with_retry(RetryConfig {
            max_attempts: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter_max: None,
        })
    }

    #[tokio::test]
    async fn finalizes_only_expired_limited_attempts() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_task(task("hour", "01:00:00")).unwrap();
        store.insert_task(task("free", "00:00:00")).unwrap();
        let now = Utc::now();
        store
            .put_attempt(attempt("late", "hour", now - ChronoDuration::hours(2)))
            .unwrap();
        store
            .put_attempt(attempt("fresh", "hour", now - ChronoDuration::minutes(5)))
            .unwrap();
        store
            .put_attempt(attempt("open", "free", now - ChronoDuration::days(30)))
            .unwrap();

        let report = sweeper(store.clone()).sweep(now).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.skipped_unlimited, 1);
        assert_eq!(report.failed, 0);

        let late = store.find_attempt("late").await.unwrap().unwrap();
        assert!(!late.is_active);
        assert!(late.completed_at.is_some());
        assert!(store.find_attempt("fresh").await.unwrap().unwrap().is_active);
        assert!(store.find_attempt("open").await.unwrap().unwrap().is_active);

        let again = sweeper(store).sweep(now).await.unwrap();
        assert_eq!(again.scanned, 2);
        assert_eq!(again.finalized, 0);
    }

    #[tokio::test]
    async fn broken_rows_do_not_stop_the_sweep() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_task(task("hour", "01:00:00")).unwrap();
        store.insert_task(task("bad", "1:2:3")).unwrap();
        store.insert_task(task("huge", "9999999999:00:00")).unwrap();
        let now = Utc::now();
        let old = now - ChronoDuration::hours(2);
        store.put_attempt(attempt("orphan", "missing", old)).unwrap();
        store.put_attempt(attempt("malformed", "bad", old)).unwrap();
        store.put_attempt(attempt("endless", "huge", old)).unwrap();
        store.put_attempt(attempt("late", "hour", old)).unwrap();

        let report = sweeper(store.clone()).sweep(now).await.unwrap();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.failed, 3);
        assert!(store.find_attempt("endless").await.unwrap().unwrap().is_active);
        assert_eq!(report.finalized, 1);
        assert!(!store.find_attempt("late").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn expires_overdue_assignments_and_solves_in_time_ones() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_task(task("hour", "01:00:00")).unwrap();
        let now = Utc::now();

        let overdue = AssignedTask {
            id: "overdue".into(),
            user_id: "s2".into(),
            task_id: "hour".into(),
            assigned_by: "teacher".into(),
            due_date: now - ChronoDuration::minutes(1),
            assigned_at: now - ChronoDuration::days(1),
            status: AssignmentStatus::Pending,
        };
        let linked = AssignedTask {
            id: "linked".into(),
            user_id: "s1".into(),
            due_date: now + ChronoDuration::days(1),
            ..overdue.clone()
        };
        store.create_assignment(&overdue).await.unwrap();
        store.create_assignment(&linked).await.unwrap();

        let mut late = attempt("late", "hour", now - ChronoDuration::hours(2));
        late.assignment_id = Some("linked".into());
        store.put_attempt(late).unwrap();

        let report = sweeper(store.clone()).sweep(now).await.unwrap();
        assert_eq!(report.assignments_expired, 1);
        assert_eq!(report.finalized, 1);

        let status = |id: &'static str| {
            let store = store.clone();
            async move { store.find_assignment(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status("overdue").await, AssignmentStatus::Expired);
        assert_eq!(status("linked").await, AssignmentStatus::Solved);
    }

    #[tokio::test]
    async fn handle_stops_the_loop() {
        let store = Arc::new(InMemoryStore::new());
        let handle = ExpirySweeper::new(store, None, Duration::from_secs(3600)).spawn();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
