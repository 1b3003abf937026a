//! HTTP API tests -- drive the router in-process with `oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use flakescope::api::{router, state::AppState};
use flakescope::storage::{MemoryStore, Store};
use flakescope::tracker::FlakinessTracker;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let tracker = FlakinessTracker::new(Store::Memory(MemoryStore::new()), 5);
    router(AppState::new(tracker))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn record(app: &Router, test_case: &str, status: &str, ms: u64) -> (StatusCode, Value) {
    send(
        app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({
            "test_case_id": test_case,
            "status": status,
            "execution_time_ms": ms
        })),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = app();
    let (status, _) = send(&app, Method::GET, "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_record_execution_created() {
    let app = app();
    let (status, body) = record(&app, "login", "passed", 800).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["execution"]["test_case_id"], "login");
    assert!(body["data"]["report"].is_null());

    let (status, body) = send(&app, Method::GET, "/api/v1/test-cases/login/executions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
}

#[tokio::test]
async fn test_record_execution_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({ "test_case_id": "login", "status": "skipped", "execution_time_ms": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid execution data"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/executions",
        Some(json!({
            "test_case_id": "login",
            "status": "passed",
            "execution_time_ms": 1,
            "dom_stability_score": 101.0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("dom_stability_score"));
}

#[tokio::test]
async fn test_flaky_lifecycle() {
    let app = app();
    let runs = [("passed", 200), ("failed", 2000), ("passed", 250), ("failed", 2600), ("passed", 210)];
    let mut last = Value::Null;
    for (status, ms) in runs {
        let (code, body) = record(&app, "profile", status, ms).await;
        assert_eq!(code, StatusCode::CREATED);
        last = body;
    }
    assert_eq!(last["data"]["report"]["is_flaky"], true);
    let id = last["data"]["flaky_test"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, "/api/v1/flaky-tests", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["test_case_id"], "profile");
    assert_eq!(body["data"][0]["failed_runs"], 2);

    let (status, body) = send(&app, Method::GET, &format!("/api/v1/flaky-tests/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_resolved"], false);

    let (status, body) = send(&app, Method::GET, "/api/v1/dashboard/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_tests"], 1);
    assert_eq!(body["data"]["flaky_test_count"], 1);
    assert_eq!(body["data"]["flaky_percentage"], 100.0);

    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/api/v1/flaky-tests/{}/resolve", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_resolved"], true);

    let (_, body) = send(&app, Method::GET, "/api/v1/flaky-tests", None).await;
    assert_eq!(body["meta"]["total"], 0);
}

#[tokio::test]
async fn test_unknown_flaky_test_is_404() {
    let app = app();
    let uri = format!("/api/v1/flaky-tests/{}", uuid::Uuid::new_v4());
    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = send(&app, Method::PATCH, &format!("{}/resolve", uri), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_test_case_analysis_on_demand() {
    let app = app();
    record(&app, "menu", "passed", 100).await;
    record(&app, "menu", "failed", 900).await;

    let (_, body) = send(&app, Method::GET, "/api/v1/test-cases/menu/analysis", None).await;
    // two runs is below the analyzer's sample floor
    assert_eq!(body["data"]["is_flaky"], false);
    assert_eq!(body["data"]["flakiness_score"], 0.0);

    record(&app, "menu", "passed", 120).await;
    let (status, body) = send(&app, Method::GET, "/api/v1/test-cases/menu/analysis", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_flaky"], true);
    assert_eq!(body["data"]["root_causes"][0]["kind"], "timing");
}

#[tokio::test]
async fn test_analyze_is_stateless() {
    let app = app();
    let history = json!([
        { "test_case_id": "grid", "status": "passed", "execution_time_ms": 1000, "dom_stability_score": 40.0 },
        { "test_case_id": "grid", "status": "failed", "execution_time_ms": 1000, "dom_stability_score": 45.0,
          "network_call_count": 8 },
        { "test_case_id": "grid", "status": "passed", "execution_time_ms": 1000, "dom_stability_score": 50.0 }
    ]);
    let (status, body) = send(&app, Method::POST, "/api/v1/analyze", Some(history)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_flaky"], true);
    assert_eq!(body["data"]["timing_variance"], 0.0);
    assert_eq!(body["meta"]["executions"], 3);

    let (_, body) = send(&app, Method::GET, "/api/v1/dashboard/stats", None).await;
    assert_eq!(body["data"]["total_tests"], 0);
}

#[tokio::test]
async fn test_analyze_rejects_out_of_range_dom_score() {
    let app = app();
    let history = json!([
        { "test_case_id": "grid", "status": "passed", "execution_time_ms": 1000, "dom_stability_score": -50.0 },
        { "test_case_id": "grid", "status": "failed", "execution_time_ms": 1000, "dom_stability_score": -50.0 },
        { "test_case_id": "grid", "status": "passed", "execution_time_ms": 1000, "dom_stability_score": -50.0 }
    ]);
    let (status, body) = send(&app, Method::POST, "/api/v1/analyze", Some(history)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("dom_stability_score"));
}
