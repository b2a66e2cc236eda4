//! Application error types and their JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::restore::RestoreError;

/// Error model used throughout request parsing, orchestration, and storage.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    InvalidRequest {
        message: String,
        code: Option<String>,
    },
    #[error("{0}")]
    BadMultipart(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Upstream { message: String, detail: Value },
    #[error("{message}")]
    PredictionFailed { message: String, detail: Value },
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Creates a `401 Unauthorized` error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Creates a `400 Bad Request` error with an optional machine-readable code.
    pub fn invalid_request(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            code: code.map(ToOwned::to_owned),
        }
    }

    /// Creates a multipart parsing/shape validation error.
    pub fn bad_multipart(message: impl Into<String>) -> Self {
        Self::BadMultipart(message.into())
    }

    /// Creates a `404 Not Found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a generic internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidRequest { .. } | AppError::BadMultipart(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { .. } | AppError::PredictionFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RestoreError> for AppError {
    fn from(err: RestoreError) -> Self {
        match err {
            RestoreError::Upstream {
                stage,
                status,
                body,
            } => AppError::Upstream {
                message: stage.failure_message().to_string(),
                detail: json!({
                    "stage": stage.as_str(),
                    "status": status,
                    "body": body,
                }),
            },
            RestoreError::PredictionFailed { detail } => AppError::PredictionFailed {
                message: "restoration failed upstream".to_string(),
                detail,
            },
            err @ RestoreError::Timeout { .. } => AppError::Timeout(err.to_string()),
            err @ RestoreError::Cancelled => AppError::Unavailable(err.to_string()),
            RestoreError::InvalidInput(message) => {
                AppError::invalid_request(message, Some("invalid_input"))
            }
            RestoreError::Internal(message) => AppError::Internal(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = match self {
            AppError::Unauthorized(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "invalid_api_key".to_string(),
            },
            AppError::InvalidRequest { message, code } => ErrorPayload {
                error: message,
                detail: None,
                code: code.unwrap_or_else(|| "invalid_request".to_string()),
            },
            AppError::BadMultipart(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "invalid_multipart".to_string(),
            },
            AppError::PayloadTooLarge(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "payload_too_large".to_string(),
            },
            AppError::NotFound(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "not_found".to_string(),
            },
            AppError::Upstream { message, detail } => ErrorPayload {
                error: message,
                detail: Some(detail),
                code: "upstream_error".to_string(),
            },
            AppError::PredictionFailed { message, detail } => ErrorPayload {
                error: message,
                detail: Some(detail),
                code: "prediction_failed".to_string(),
            },
            AppError::Timeout(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "prediction_timeout".to_string(),
            },
            AppError::Unavailable(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "cancelled".to_string(),
            },
            AppError::Internal(message) => ErrorPayload {
                error: message,
                detail: None,
                code: "internal_error".to_string(),
            },
        };

        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use serde_json::json;

    use super::AppError;
    use crate::restore::{RestoreError, Stage};

    #[test]
    fn upstream_stage_failures_map_to_bad_gateway() {
        let err = AppError::from(RestoreError::Upstream {
            stage: Stage::AcquireUpload,
            status: Some(401),
            body: "unauthenticated".to_string(),
        });
        assert_eq!(err.to_string(), "failed to acquire upload url");
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = AppError::from(RestoreError::Timeout { attempts: 60 });
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn prediction_failure_keeps_upstream_detail() {
        let err = AppError::from(RestoreError::PredictionFailed {
            detail: json!({"status": "failed", "error": "no face"}),
        });
        match &err {
            AppError::PredictionFailed { detail, .. } => assert_eq!(detail["error"], "no face"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
