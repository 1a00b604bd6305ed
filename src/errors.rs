use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::ml::ModelError;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Not enough history, missing days or no scene for the requested date.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Model not ready: {0}")]
    Uninitialized(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::DataUnavailable(_)
            | AppError::Uninitialized(_)
            | AppError::ExternalServiceError(_)
            | AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let message = match self {
            AppError::BadRequest(msg)
            | AppError::DataUnavailable(msg)
            | AppError::Uninitialized(msg)
            | AppError::ExternalServiceError(msg)
            | AppError::InternalError(msg) => msg,
        };
        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Uninitialized(_) => AppError::Uninitialized(err.to_string()),
            ModelError::InsufficientData { .. } => AppError::DataUnavailable(err.to_string()),
            other => AppError::InternalError(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(format!("Invalid JSON body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(format!("Invalid query string: {}", rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_bad_request_is_400_with_message() {
        let (status, body) = body_of(AppError::BadRequest("Missing required parameters".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({"error": "Missing required parameters"}));
    }

    #[tokio::test]
    async fn test_server_side_failures_are_500() {
        for err in [
            AppError::DataUnavailable("no scene".into()),
            AppError::Uninitialized("scaler".into()),
            AppError::ExternalServiceError("timeout".into()),
            AppError::InternalError("boom".into()),
        ] {
            let (status, body) = body_of(err).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body["error"].is_string());
        }
    }

    #[test]
    fn test_model_errors_map_to_app_errors() {
        assert!(matches!(
            AppError::from(ModelError::Uninitialized("min-max scaler")),
            AppError::Uninitialized(_)
        ));
        assert!(matches!(
            AppError::from(ModelError::InsufficientData { needed: 30, got: 3 }),
            AppError::DataUnavailable(_)
        ));
        assert!(matches!(
            AppError::from(ModelError::Diverged(4)),
            AppError::InternalError(_)
        ));
    }
}
