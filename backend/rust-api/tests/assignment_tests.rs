use axum::http::StatusCode;
use chrono::{Duration, Utc};
use sentence_trainer_api::models::{AssignedTask, AssignmentStatus};
use sentence_trainer_api::store::ProgressStore;
use serde_json::json;

mod common;

use common::{send, start_attempt, token, TASK_ID};

fn due_in(delta: Duration) -> String {
    (Utc::now() + delta).to_rfc3339()
}

#[tokio::test]
async fn test_only_staff_can_assign() {
    let app = common::create_test_app();
    let student = token("student-1", "student");
    let teacher = token("teacher-1", "teacher");
    let body = json!({
        "user_id": "student-1",
        "task_id": TASK_ID,
        "due_date": due_in(Duration::days(1)),
    });

    let (status, _) = send(&app, "POST", "/api/assignedTasks", Some(&student), Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = send(&app, "POST", "/api/assignedTasks", Some(&teacher), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["assigned_by"], "teacher-1");

    let (status, list) = send(&app, "GET", "/api/assignedTasks", Some(&student), None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], created["id"]);
}

#[tokio::test]
async fn test_assignment_requires_future_due_date() {
    let app = common::create_test_app();
    let teacher = token("teacher-1", "admin");

    let (status, _) = send(
        &app,
        "POST",
        "/api/assignedTasks",
        Some(&teacher),
        Some(json!({
            "user_id": "student-1",
            "task_id": TASK_ID,
            "due_date": due_in(Duration::minutes(-5)),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mark_solved_requires_finished_attempt() {
    let app = common::create_test_app();
    let student = token("student-1", "student");
    let teacher = token("teacher-1", "teacher");
    let patch_uri = format!("/api/assignedTasks/{}", TASK_ID);

    let (status, _) = send(&app, "PATCH", &patch_uri, Some(&student), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &app,
        "POST",
        "/api/assignedTasks",
        Some(&teacher),
        Some(json!({
            "user_id": "student-1",
            "task_id": TASK_ID,
            "due_date": due_in(Duration::days(2)),
        })),
    )
    .await;

    // Nothing answered yet.
    let (status, _) = send(&app, "PATCH", &patch_uri, Some(&student), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // An attempt still in progress does not count either.
    let attempt = start_attempt(&app, &student, TASK_ID).await;
    let (status, _) = send(&app, "PATCH", &patch_uri, Some(&student), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, list) = send(&app, "GET", "/api/assignedTasks", Some(&student), None).await;
    assert_eq!(list[0]["status"], "pending");

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/task_prog/{}", attempt["id"].as_str().unwrap()),
        Some(&student),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "PATCH", &patch_uri, Some(&student), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "solved");
}

#[tokio::test]
async fn test_expired_assignment_cannot_be_solved() {
    let app = common::create_test_app();
    let student = token("student-1", "student");
    let now = Utc::now();
    app.store
        .create_assignment(&AssignedTask {
            id: "late".to_string(),
            user_id: "student-1".to_string(),
            task_id: TASK_ID.to_string(),
            assigned_by: "teacher-1".to_string(),
            due_date: now - Duration::seconds(1),
            assigned_at: now - Duration::days(1),
            status: AssignmentStatus::Pending,
        })
        .await
        .unwrap();

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/assignedTasks/{}", TASK_ID),
        Some(&student),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "POST",
        "/api/tasks/prog",
        Some(&student),
        Some(json!({ "task_id": TASK_ID, "assignment_id": "late" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_finishing_an_assigned_attempt_solves_it() {
    let app = common::create_test_app();
    let student = token("student-1", "student");
    let teacher = token("teacher-1", "teacher");

    let (_, assignment) = send(
        &app,
        "POST",
        "/api/assignedTasks",
        Some(&teacher),
        Some(json!({
            "user_id": "student-1",
            "task_id": TASK_ID,
            "due_date": due_in(Duration::days(1)),
        })),
    )
    .await;
    let assignment_id = assignment["id"].as_str().unwrap();

    let other = token("student-2", "student");
    let (status, _) = send(
        &app,
        "POST",
        "/api/tasks/prog",
        Some(&other),
        Some(json!({ "task_id": TASK_ID, "assignment_id": assignment_id })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, attempt) = send(
        &app,
        "POST",
        "/api/tasks/prog",
        Some(&student),
        Some(json!({ "task_id": TASK_ID, "assignment_id": assignment_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(attempt["assignment_id"], assignment_id);

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/task_prog/{}", attempt["id"].as_str().unwrap()),
        Some(&student),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let stored = app.store.find_assignment(assignment_id).await.unwrap().unwrap();
    assert_eq!(stored.status, AssignmentStatus::Solved);
}
