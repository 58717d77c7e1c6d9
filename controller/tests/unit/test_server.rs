//! Operator HTTP surface tests

mod mocks;

use std::sync::Arc;

use agent_protocol::BackupRecord;
use axum::body::{to_bytes, Body};
use http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use spotforge::server::serve::router;
use spotforge::server::state::ServerState;

use mocks::*;

async fn call(app: axum::Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn app(harness: &Harness) -> axum::Router {
    let orchestrator = harness.open(fast_options(closed_port().await)).await;
    router(Arc::new(ServerState::new("0.1.0".to_string(), orchestrator)))
}

#[tokio::test]
async fn test_status_and_queries() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    let app = app(&harness).await;

    let (status, body) = call(app.clone(), "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage_code"], 2000);
    assert_eq!(body["running"], false);

    let (status, body) = call(app.clone(), "GET", "/instance?key=instance_id", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);

    let (_, body) = call(app, "GET", "/health", None).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_backup_pending_is_a_conflict() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    harness
        .layout
        .backup_ledger_file()
        .write_json(&vec![BackupRecord {
            name: "inc-1".to_string(),
            time: 1,
        }])
        .await
        .unwrap();
    let app = app(&harness).await;

    let (status, body) = call(app.clone(), "POST", "/server/launch", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("restorelaunch"));
    assert!(message.contains("discardbackup"));

    let (status, _) = call(app, "POST", "/server/kill", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_command_is_queued_while_idle() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    let app = app(&harness).await;

    let (status, body) = call(
        app.clone(),
        "POST",
        "/server/command",
        Some(r#"{"command":"whitelist add alex"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = call(app, "GET", "/server/commands", None).await;
    assert_eq!(body["commands"][0], "whitelist add alex");
}
