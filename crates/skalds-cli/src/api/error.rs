//! HTTP error envelope: `{error, detail, code, timestamp}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Serialize;

/// Machine-readable error codes exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    TaskNotFound,
    SkaldNotFound,
    ServiceUnavailable,
    InvalidStatus,
}

pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    error: String,
    detail: String,
}

impl ApiError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::ValidationError,
            error: "invalid request".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn invalid_status(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::InvalidStatus,
            error: "invalid status transition".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn task_not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ErrorCode::TaskNotFound,
            error: "task not found".to_owned(),
            detail: format!("no task with id {id}"),
        }
    }

    pub fn skald_not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ErrorCode::SkaldNotFound,
            error: "skald not found".to_owned(),
            detail: format!("no skald with id {id}"),
        }
    }

    /// Store/cache/event failure surfaced to the caller. The underlying
    /// error goes to the log, not the wire.
    pub fn unavailable(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed on backing service");
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: ErrorCode::ServiceUnavailable,
            error: "backing service unavailable".to_owned(),
            detail: "the request could not be served; retry shortly".to_owned(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
    code: ErrorCode,
    /// Epoch millis, as a string like every timestamp on this API.
    timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody {
            error: self.error,
            detail: self.detail,
            code: self.code,
            timestamp: Utc::now().timestamp_millis().to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ValidationError).expect("serialize");
        assert_eq!(json, "\"VALIDATION_ERROR\"");
        let json = serde_json::to_string(&ErrorCode::TaskNotFound).expect("serialize");
        assert_eq!(json, "\"TASK_NOT_FOUND\"");
    }
}
