use axum::http::StatusCode;
use serde_json::json;

mod common;

use common::{create_test_app, send, terminal_event, Reply, ScriptedCompletion, TestApp};

async fn display(app: &TestApp, user: &str) -> serde_json::Value {
    let (status, body) = send(&app.router, "GET", "/api/v1/playground", Some(user), None).await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    serde_json::from_str(&body).unwrap()
}

async fn put(app: &TestApp, user: &str, uri: &str, body: serde_json::Value) -> serde_json::Value {
    let (status, body) = send(&app.router, "PUT", uri, Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn test_fresh_session_is_empty() {
    let app = create_test_app(ScriptedCompletion::new(vec![]));

    let state = display(&app, "bob").await;
    assert_eq!(state["exercise"], "Linear search");
    assert_eq!(state["code"], "");
    assert_eq!(state["feedback"], "");
    assert_eq!(state["source"], "empty");
    assert_eq!(state["grading"], false);
    assert!(state.get("passed").is_none());
}

#[tokio::test]
async fn test_submit_grades_buffer_and_shows_result() {
    let app = create_test_app(ScriptedCompletion::new(vec![Reply::Chunks(vec![
        "// nice\n",
        "{ passed: true }",
    ])]));

    put(&app, "bob", "/api/v1/playground/buffer", json!({ "code": "let i = 0;" })).await;

    let (status, body) = send(&app.router, "POST", "/api/v1/playground/submit", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (name, graded) = terminal_event(&body);
    assert_eq!(name, "graded");
    assert_eq!(graded["submission"]["exercise"], "Linear search");
    assert_eq!(graded["submission"]["submission"], "let i = 0;");

    let state = display(&app, "bob").await;
    assert_eq!(state["source"], "in_flight");
    assert_eq!(state["grading"], false);
    assert_eq!(state["passed"], true);
    assert_eq!(state["code"], "let i = 0;");
    assert_eq!(state["feedback"], "// nice\n{ passed: true }");
}

#[tokio::test]
async fn test_empty_buffer_submit_is_rejected() {
    let app = create_test_app(ScriptedCompletion::new(vec![]));

    put(&app, "bob", "/api/v1/playground/buffer", json!({ "code": "   " })).await;
    let (status, _) = send(&app.router, "POST", "/api/v1/playground/submit", Some("bob"), None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.completions.calls(), 0);
    assert!(app.store.inner.is_empty().await);
}

#[tokio::test]
async fn test_switching_exercise_mid_grading_does_not_leak_result() {
    let app = create_test_app(ScriptedCompletion::gated(vec![Reply::Chunks(vec![
        "// linear is fine\n",
        "{ passed: true }",
    ])]));

    put(&app, "bob", "/api/v1/playground/buffer", json!({ "code": "linear()" })).await;

    // The response arrives at once; grading waits behind the gate
    let router = app.router.clone();
    let pending = tokio::spawn(async move {
        send(&router, "POST", "/api/v1/playground/submit", Some("bob"), None).await
    });

    // Wait until grading has really started
    for _ in 0..100 {
        if app.completions.calls() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(app.completions.calls(), 1);
    assert_eq!(display(&app, "bob").await["grading"], true);

    let switched = put(
        &app,
        "bob",
        "/api/v1/playground/exercise",
        json!({ "exercise": "Binary search" }),
    )
    .await;
    assert_eq!(switched["exercise"], "Binary search");
    assert_eq!(switched["source"], "empty");

    app.completions.open_gate();
    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    let (name, _) = terminal_event(&body);
    assert_eq!(name, "graded");

    // Display for the new exercise is untouched by the late result
    assert_eq!(display(&app, "bob").await, switched);

    // Going back shows the stored linear-search record
    let back = put(
        &app,
        "bob",
        "/api/v1/playground/exercise",
        json!({ "exercise": "Linear search" }),
    )
    .await;
    assert_eq!(back["source"], "persisted");
    assert_eq!(back["code"], "linear()");
    assert_eq!(back["passed"], true);
    assert_eq!(back["feedback"], "// linear is fine\n{ passed: true }");
}

#[tokio::test]
async fn test_reset_clears_current_exercise() {
    let app = create_test_app(ScriptedCompletion::new(vec![]));

    put(&app, "bob", "/api/v1/playground/buffer", json!({ "code": "linear()" })).await;
    send(&app.router, "POST", "/api/v1/playground/submit", Some("bob"), None).await;
    assert_eq!(app.store.inner.len().await, 1);

    let (status, body) = send(
        &app.router,
        "DELETE",
        "/api/v1/playground/submission",
        Some("bob"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let state: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(state["source"], "empty");
    assert_eq!(state["code"], "");
    assert!(app.store.inner.is_empty().await);

    // Resetting again is harmless
    let (status, _) = send(
        &app.router,
        "DELETE",
        "/api/v1/playground/submission",
        Some("bob"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_direct_grading_refreshes_playground_view() {
    let app = create_test_app(ScriptedCompletion::new(vec![Reply::Chunks(vec![
        "{ passed: false }",
    ])]));

    assert_eq!(display(&app, "bob").await["source"], "empty");

    send(
        &app.router,
        "POST",
        "/api/v1/submissions",
        Some("bob"),
        Some(json!({ "code": "from elsewhere", "exercise": "Linear search" })),
    )
    .await;

    let state = display(&app, "bob").await;
    assert_eq!(state["source"], "persisted");
    assert_eq!(state["passed"], false);
    assert_eq!(state["feedback"], "{ passed: false }");
}

async fn submit_in_playground(app: &TestApp, user: &str, code: &str) -> serde_json::Value {
    put(app, user, "/api/v1/playground/buffer", json!({ "code": code })).await;
    let (status, body) = send(&app.router, "POST", "/api/v1/playground/submit", Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
    let (name, graded) = terminal_event(&body);
    assert_eq!(name, "graded");
    graded
}

#[tokio::test]
async fn test_deleting_record_by_id_clears_playground_view() {
    let app = create_test_app(ScriptedCompletion::new(vec![Reply::Chunks(vec![
        "// ok ",
        "{ passed: true }",
    ])]));

    let graded = submit_in_playground(&app, "bob", "linear()").await;
    assert_eq!(display(&app, "bob").await["passed"], true);

    let id = graded["submission"]["id"].as_str().unwrap();
    let (status, _) = send(
        &app.router,
        "DELETE",
        &format!("/api/v1/submissions/{}", id),
        Some("bob"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.store.inner.is_empty().await);

    let state = display(&app, "bob").await;
    assert_eq!(state["source"], "empty");
    assert_eq!(state["feedback"], "");
    assert!(state.get("passed").is_none());
}

#[tokio::test]
async fn test_resetting_exercise_route_clears_playground_view() {
    let app = create_test_app(ScriptedCompletion::new(vec![Reply::Chunks(vec![
        "// ok ",
        "{ passed: true }",
    ])]));

    submit_in_playground(&app, "bob", "linear()").await;

    let (status, _) = send(
        &app.router,
        "DELETE",
        "/api/v1/submissions/exercise/Linear%20search",
        Some("bob"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let state = display(&app, "bob").await;
    assert_eq!(state["source"], "empty");
    assert_eq!(state["code"], "");
    assert!(state.get("passed").is_none());
}
