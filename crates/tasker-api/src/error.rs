//! API error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use statement_tasker::TaskerError;
use thiserror::Error;

/// Error returned by API handlers.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct ApiError(#[from] pub TaskerError);

impl ApiError {
    /// HTTP status for the wrapped error.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TaskerError::Conflict(_) | TaskerError::ConcurrentExecution(_) => StatusCode::CONFLICT,
            TaskerError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            TaskerError::NotFound(_) | TaskerError::PreviousExecutionNotFound(_) => StatusCode::NOT_FOUND,
            TaskerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TaskerError::Gateway(_) => StatusCode::BAD_GATEWAY,
            TaskerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::warn!(error = %self.0, "Request rejected");
        }

        let body = Json(json!({
            "error": self.0.error_name(),
            "cause": self.0.cause(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (TaskerError::ConcurrentExecution("x".into()), StatusCode::CONFLICT),
            (TaskerError::Throttled("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (TaskerError::PreviousExecutionNotFound("x".into()), StatusCode::NOT_FOUND),
            (TaskerError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (TaskerError::Gateway("x".into()), StatusCode::BAD_GATEWAY),
            (TaskerError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (TaskerError::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
