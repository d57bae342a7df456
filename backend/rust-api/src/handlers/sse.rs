use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::actor;
use crate::{
    error::{AppError, AppResult},
    metrics::SSE_CONNECTIONS_ACTIVE,
    middlewares::auth::JwtClaims,
    models::timer::{TimeExpired, TimerEvent, TimerTick},
    models::TaskProgress,
    services::{progress_service::ProgressService, AppState},
};

/// Countdown for a timed attempt.
/// GET /api/task_prog/{id}/stream
///
/// Emits `timer-tick` until the deadline, then finalizes the attempt and
/// emits a single `time-expired`. Unlimited attempts get 204.
pub async fn attempt_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let service = state.progress_service();
    let (attempt, budget) = service.countdown_target(&id, actor(&claims)).await?;

    let (Some(deadline), Some(total_ms)) = (budget.deadline(attempt.started_at), budget.duration_ms())
    else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    if !attempt.is_active {
        return Err(AppError::Conflict("attempt is already finished".to_string()));
    }

    let tick = Duration::from_millis(state.config.timer_tick_interval_ms);
    tracing::info!(
        task_progress_id = %attempt.id,
        total_seconds = total_ms / 1000,
        tick_interval_ms = state.config.timer_tick_interval_ms,
        "Starting countdown stream"
    );

    let countdown = Countdown {
        service,
        attempt,
        deadline,
        total_seconds: (total_ms / 1000) as u64,
        tick,
        first: true,
        _guard: StreamGuard::open(),
    };

    Ok(Sse::new(countdown_stream(countdown))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Keeps the active-stream gauge accurate however the stream ends.
struct StreamGuard;

impl StreamGuard {
    fn open() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        StreamGuard
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

struct Countdown {
    service: ProgressService,
    attempt: TaskProgress,
    deadline: DateTime<Utc>,
    total_seconds: u64,
    tick: Duration,
    first: bool,
    _guard: StreamGuard,
}

impl Countdown {
    fn tick_event(&self, now: DateTime<Utc>) -> TimerEvent {
        let remaining_ms = (self.deadline - now).num_milliseconds().max(0);
        let elapsed_ms = (now - self.attempt.started_at).num_milliseconds().max(0);
        TimerEvent::TimerTick(TimerTick {
            task_progress_id: self.attempt.id.clone(),
            // rounded up so that zero only shows at expiry
            remaining_seconds: ((remaining_ms + 999) / 1000) as u64,
            elapsed_seconds: ((elapsed_ms / 1000) as u64).min(self.total_seconds),
            total_seconds: self.total_seconds,
            deadline: self.deadline,
            timestamp: now,
        })
    }
}

fn to_event(event: &TimerEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(event.to_sse_data())
}

fn countdown_stream(countdown: Countdown) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(countdown), |state| async move {
        let mut countdown = state?;

        if !countdown.first {
            let now = Utc::now();
            let wait = (countdown.deadline - now)
                .to_std()
                .map(|left| left.min(countdown.tick))
                .unwrap_or(Duration::ZERO);
            sleep(wait).await;
        }
        countdown.first = false;

        // Someone else (client PATCH, sweeper) may have finished the attempt.
        match countdown.service.find_attempt(&countdown.attempt.id).await {
            Ok(Some(current)) if current.is_active => {}
            Ok(_) => {
                tracing::info!(task_progress_id = %countdown.attempt.id, "Attempt no longer active, closing stream");
                return None;
            }
            Err(err) => {
                tracing::warn!(task_progress_id = %countdown.attempt.id, error = %err, "Countdown reload failed");
                return None;
            }
        }

        let now = Utc::now();
        if now < countdown.deadline {
            let event = to_event(&countdown.tick_event(now));
            return Some((Ok(event), Some(countdown)));
        }

        let outcome = match countdown
            .service
            .finalize_attempt(&countdown.attempt, now)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(task_progress_id = %countdown.attempt.id, error = %err, "Countdown finalization failed");
                return None;
            }
        };

        tracing::info!(task_progress_id = %countdown.attempt.id, "Timer expired");
        let expired = TimerEvent::TimeExpired(TimeExpired {
            task_progress_id: outcome.attempt.id.clone(),
            completed_at: outcome.attempt.completed_at,
            correct_answers: outcome.attempt.correct_answers,
            timestamp: now,
        });
        Some((Ok(to_event(&expired)), None))
    })
}
