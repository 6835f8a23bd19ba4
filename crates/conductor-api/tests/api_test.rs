//! HTTP-level tests for the engine API.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use conductor_api::{create_router, AppState, ErrorResponse};
use conductor_workflow::{
    AgentClient, AgentResponse, ClientError, InputSpec, RunSnapshot, RunStatus, StepDefinition,
    TemplateStore, WorkflowEngine, WorkflowTemplate,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// ==================== Test Setup ====================

struct EchoAgent;

#[async_trait]
impl AgentClient for EchoAgent {
    async fn invoke(&self, agent: &str, payload: &Value) -> Result<AgentResponse, ClientError> {
        Ok(AgentResponse::ok(json!({ "agent": agent, "payload": payload })))
    }
}

/// build -> approve -> deploy, requiring an `env` input
fn release_template() -> WorkflowTemplate {
    WorkflowTemplate::new("release")
        .with_description("Build, approve and deploy")
        .with_input(InputSpec {
            name: "env".to_string(),
            required: true,
            description: None,
            default: None,
        })
        .with_step(StepDefinition::agent("build", "builder").with_payload(json!({"env": "{{ env }}"})))
        .with_step(
            StepDefinition::approval("approve")
                .depends_on(["build"])
                .with_payload(json!({"summary": "Release to {{ env }}"})),
        )
        .with_step(StepDefinition::agent("deploy", "deployer").depends_on(["approve"]))
}

fn app() -> (Router, WorkflowEngine) {
    let templates = TemplateStore::new();
    templates.register(release_template()).unwrap();
    let engine = WorkflowEngine::builder()
        .templates(Arc::new(templates))
        .agent_client(Arc::new(EchoAgent))
        .build();
    (create_router(AppState::new(engine.clone())), engine)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn start_release(app: &Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/execute",
        Some(json!({"template_name": "release", "context": {"env": "staging"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["run_id"].as_str().unwrap().to_string()
}

async fn wait_for(app: &Router, run_id: &str, expected: RunStatus) -> RunSnapshot {
    for _ in 0..300 {
        let (status, body) = send(app, "GET", &format!("/api/v1/status/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: RunSnapshot = serde_json::from_value(body).unwrap();
        if snapshot.status == expected {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached {}", run_id, expected);
}

fn error_code(body: Value) -> String {
    serde_json::from_value::<ErrorResponse>(body).unwrap().error
}

// ==================== Execute Tests ====================

#[tokio::test]
async fn test_execute_unknown_template() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/execute",
        Some(json!({"template_name": "nope", "context": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(body), "TEMPLATE_NOT_FOUND");
}

#[tokio::test]
async fn test_execute_missing_input() {
    let (app, engine) = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/execute",
        Some(json!({"template_name": "release", "context": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(body), "INVALID_CONTEXT");
    assert!(engine.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_execute_malformed_body() {
    let (app, _) = app();
    let (status, body) = send(&app, "POST", "/api/v1/execute", Some(json!({"context": {}}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(body), "BAD_REQUEST");
}

// ==================== Resume Tests ====================

#[tokio::test]
async fn test_approval_round_trip() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    let waiting = wait_for(&app, &run_id, RunStatus::WaitingApproval).await;
    assert!(waiting.pending_approval.is_some());

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/resume/{}", run_id),
        Some(json!({"payload": {"approved": true, "approver": "ops"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run_id"], run_id.as_str());

    let done = wait_for(&app, &run_id, RunStatus::Completed).await;
    assert_eq!(done.progress_percent, 100.0);
}

#[tokio::test]
async fn test_resume_without_verdict() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/resume/{}", run_id),
        Some(json!({"payload": {"note": "looks fine"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(body), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_rejection_is_forbidden() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    // Bare payload without the wrapper
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/resume/{}", run_id),
        Some(json!({"decision": "rejected"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(body), "APPROVAL_REJECTED");

    wait_for(&app, &run_id, RunStatus::Failed).await;
}

#[tokio::test]
async fn test_resume_cancelled_run_conflicts() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/cancel/{}", run_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/resume/{}", run_id),
        Some(json!({"payload": {"approved": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(body), "INVALID_STATE");
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_status_unknown_run() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/api/v1/status/missing", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(body), "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_twice_conflicts() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    let uri = format!("/api/v1/cancel/{}", run_id);
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_pause_and_unpause() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    // Waiting on a human is not pausable
    let (status, _) = send(&app, "POST", &format!("/api/v1/pause/{}", run_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "POST", &format!("/api/v1/unpause/{}", run_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_runs_and_templates() {
    let (app, _) = app();
    let run_id = start_release(&app).await;
    wait_for(&app, &run_id, RunStatus::WaitingApproval).await;

    let (status, body) = send(&app, "GET", "/api/v1/runs?status=waiting_approval", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "GET", "/api/v1/runs?status=completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = send(&app, "GET", "/api/v1/runs?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(body), "BAD_REQUEST");

    let (status, body) = send(&app, "GET", "/api/v1/templates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "release");
    assert_eq!(body[0]["step_count"], 3);
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["templates"], 1);
}
