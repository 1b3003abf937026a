//! API route definitions.

use crate::api::state::AppState;
use crate::api::ApiError;
use crate::flaky::{self, ExecutionRecord, NewExecution};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(record_execution))
        .route("/test-cases/{id}/executions", get(list_executions))
        .route("/test-cases/{id}/analysis", get(test_case_analysis))
        .route("/analyze", post(analyze))
        .route("/flaky-tests", get(list_flaky_tests))
        .route("/flaky-tests/{id}", get(get_flaky_test))
        .route("/flaky-tests/{id}/resolve", patch(resolve_flaky_test))
        .route("/dashboard/stats", get(dashboard_stats))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn record_execution(
    State(state): State<AppState>,
    payload: Result<Json<NewExecution>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(execution) =
        payload.map_err(|e| ApiError::BadRequest(format!("invalid execution data: {}", e)))?;
    let outcome = state.tracker.record_execution(execution).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": outcome, "meta": meta() })),
    ))
}

async fn list_executions(
    State(state): State<AppState>,
    Path(test_case_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let executions = state.tracker.executions_for(&test_case_id).await?;
    Ok(Json(json!({
        "data": executions,
        "meta": { "total": executions.len(), "test_case_id": test_case_id }
    })))
}

async fn test_case_analysis(
    State(state): State<AppState>,
    Path(test_case_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.tracker.analysis_for(&test_case_id).await?;
    Ok(Json(json!({
        "data": report,
        "meta": { "test_case_id": test_case_id }
    })))
}

/// Analyse a posted history without storing anything.
async fn analyze(
    payload: Result<Json<Vec<ExecutionRecord>>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(executions) =
        payload.map_err(|e| ApiError::BadRequest(format!("invalid execution list: {}", e)))?;
    executions.iter().try_for_each(ExecutionRecord::validate)?;
    let report = flaky::analyze(&executions);
    Ok(Json(json!({
        "data": report,
        "meta": { "executions": executions.len() }
    })))
}

async fn list_flaky_tests(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let records = state.tracker.list_flaky().await?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}

async fn get_flaky_test(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let record = state.tracker.get_flaky(id).await?;
    Ok(Json(json!({ "data": record, "meta": meta() })))
}

async fn resolve_flaky_test(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let record = state.tracker.resolve(id).await?;
    Ok(Json(json!({ "data": record, "meta": meta() })))
}

async fn dashboard_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.tracker.dashboard_stats().await?;
    Ok(Json(json!({ "data": stats, "meta": meta() })))
}
