//! Request handlers for the engine API

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use conductor_workflow::{RunSnapshot, RunStatus, TemplateSummary};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

type AppStateRef = State<Arc<AppState>>;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub template_name: String,
    #[serde(default = "empty_object")]
    pub context: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub run_id: String,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub templates: usize,
    pub active_runs: usize,
}

pub async fn execute(
    State(state): AppStateRef,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let Json(request) = body?;
    let run_id = state
        .engine
        .execute(&request.template_name, request.context)
        .await?;
    info!(run_id = %run_id, template = %request.template_name, "Run accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            run_id,
            status: RunStatus::Pending,
        }),
    ))
}

pub async fn get_status(
    State(state): AppStateRef,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.engine.get_status(&run_id).await?))
}

/// Accepts `{"payload": {...}}`; a body without a `payload` key is taken as
/// the payload itself.
pub async fn resume(
    State(state): AppStateRef,
    Path(run_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<RunSnapshot>> {
    let Json(body) = body?;
    let payload = match body {
        Value::Object(mut map) if map.contains_key("payload") => {
            map.remove("payload").unwrap_or(Value::Null)
        }
        other => other,
    };
    Ok(Json(state.engine.resume(&run_id, payload).await?))
}

pub async fn cancel(
    State(state): AppStateRef,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.engine.cancel(&run_id).await?))
}

pub async fn pause(
    State(state): AppStateRef,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.engine.pause(&run_id).await?))
}

pub async fn unpause(
    State(state): AppStateRef,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.engine.unpause(&run_id).await?))
}

pub async fn list_runs(
    State(state): AppStateRef,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<RunSnapshot>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.engine.list_runs(status).await?))
}

pub async fn list_templates(State(state): AppStateRef) -> Json<Vec<TemplateSummary>> {
    Json(state.engine.templates().list())
}

pub async fn health_check(State(state): AppStateRef) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        templates: state.engine.templates().len(),
        active_runs: state.engine.active_runs(),
    })
}
