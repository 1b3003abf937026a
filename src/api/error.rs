use crate::flaky::FlakyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error returned by handlers, rendered as `{ "error": "..." }`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Flaky(FlakyError),
}

impl From<FlakyError> for ApiError {
    fn from(err: FlakyError) -> Self {
        ApiError::Flaky(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Flaky(err @ FlakyError::InvalidExecution { .. }) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Flaky(err @ FlakyError::NotFound(_)) => (StatusCode::NOT_FOUND, err.to_string()),
            ApiError::Flaky(err) => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
