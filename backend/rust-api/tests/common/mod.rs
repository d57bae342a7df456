#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use sentence_trainer_api::{
    config::{Config, StorageBackend, SweeperConfig},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::{Exercise, Task},
    services::AppState,
    store::InMemoryStore,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const TASK_ID: &str = "task-daily-routine";
pub const TIMED_TASK_ID: &str = "task-timed";
pub const SHORT_TASK_ID: &str = "task-five-seconds";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryStore>,
}

pub fn test_config() -> Config {
    Config {
        storage: StorageBackend::Memory,
        mongo_uri: String::new(),
        mongo_database: String::new(),
        redis_uri: None,
        jwt_secret: JWT_SECRET.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        sweeper: SweeperConfig {
            enabled: false,
            interval_secs: 60,
        },
        timer_tick_interval_ms: 50,
    }
}

pub fn create_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(InMemoryStore::new());
    seed_test_data(&store);

    let app_state = Arc::new(AppState::with_store(test_config(), store.clone(), None));
    TestApp {
        router: create_router(app_state),
        store,
    }
}

/// Tasks with two exercises each: unlimited, a 1-minute limit with a single
/// try, and a 5-second limit.
fn seed_test_data(store: &InMemoryStore) {
    let base = Utc::now() - Duration::days(1);
    for (task_id, time_constraint, tries) in
        [
            (TASK_ID, "00:00:00", 0u32),
            (TIMED_TASK_ID, "00:01:00", 1u32),
            (SHORT_TASK_ID, "00:00:05", 0u32),
        ]
    {
        store
            .insert_task(Task {
                id: task_id.to_string(),
                name: format!("{task_id} name"),
                created_by: "teacher-1".to_string(),
                tries_number: tries,
                exercises_number: 2,
                time_constraint: time_constraint.to_string(),
                created_at: base,
            })
            .unwrap();

        for (i, sentence) in ["I love cats.", "She reads books every day."]
            .into_iter()
            .enumerate()
        {
            store
                .insert_exercise(Exercise {
                    id: format!("{task_id}-ex{i}"),
                    translation: format!("translation {i}"),
                    correct_sentence: sentence.to_string(),
                    words: sentence
                        .trim_end_matches('.')
                        .split(' ')
                        .map(String::from)
                        .collect(),
                    explanation: Some("Present simple".to_string()),
                    tags: vec!["present-simple".to_string()],
                    task_id: Some(task_id.to_string()),
                    created_by: "teacher-1".to_string(),
                    created_at: base + Duration::minutes(i as i64),
                })
                .unwrap();
        }
    }
}

pub fn token(user_id: &str, role: &str) -> String {
    let now = Utc::now().timestamp();
    JwtService::new(JWT_SECRET)
        .generate_token(&JwtClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (now + 3600) as usize,
            iat: now as usize,
        })
        .unwrap()
}

/// Sends a request and returns the status with the body parsed as JSON (`Null` if empty).
pub async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

/// Starts an attempt and returns its JSON view.
pub async fn start_attempt(app: &TestApp, token: &str, task_id: &str) -> Value {
    let (status, body) = send(
        app,
        "POST",
        "/api/tasks/prog",
        Some(token),
        Some(serde_json::json!({ "task_id": task_id })),
    )
    .await;
    if status != StatusCode::CREATED {
        panic!("unexpected status {} body {}", status, body);
    }
    body
}
