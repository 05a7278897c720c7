//! Statement service error types.

use thiserror::Error;

/// Errors surfaced by the statement service.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Request was rate limited; safe to retry with backoff.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Statement does not exist (or has expired on the service side).
    #[error("Statement not found: {0}")]
    NotFound(String),

    /// Service rejected the operation.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Transport level failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response could not be decoded.
    #[error("JSON error: {0}")]
    Json(String),
}

impl GatewayError {
    /// Whether the error is a transient throttling condition.
    pub fn is_throttled(&self) -> bool {
        matches!(self, GatewayError::Throttled(_))
    }

    /// Map a service error type name (`__type`) and message to a gateway error.
    ///
    /// Type names may carry a namespace prefix (`com.amazonaws...#ThrottlingException`).
    pub fn from_service(error_type: &str, message: String) -> Self {
        let name = error_type.rsplit('#').next().unwrap_or(error_type);
        match name {
            "ThrottlingException"
            | "TooManyRequestsException"
            | "ActiveStatementsExceededException" => GatewayError::Throttled(message),
            "ResourceNotFoundException" => GatewayError::NotFound(message),
            _ => GatewayError::Rejected(format!("{}: {}", name, message)),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(429) {
            GatewayError::Throttled(e.to_string())
        } else {
            GatewayError::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::NotFound("abc".to_string());
        assert_eq!(err.to_string(), "Statement not found: abc");

        let err = GatewayError::Throttled("slow down".to_string());
        assert_eq!(err.to_string(), "Throttled: slow down");
    }

    #[test]
    fn test_from_service_type() {
        let err = GatewayError::from_service(
            "com.amazonaws.redshiftdata#ThrottlingException",
            "Rate exceeded".to_string(),
        );
        assert!(err.is_throttled());

        let err = GatewayError::from_service("ResourceNotFoundException", "gone".to_string());
        assert!(matches!(err, GatewayError::NotFound(_)));

        let err = GatewayError::from_service("ValidationException", "bad sql".to_string());
        assert!(matches!(err, GatewayError::Rejected(ref m) if m.contains("ValidationException")));
        assert!(!err.is_throttled());
    }
}
