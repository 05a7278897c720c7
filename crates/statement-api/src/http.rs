//! HTTP client for the statement service.
//!
//! Speaks the AWS JSON-1.1 protocol: every operation is a `POST` to the
//! endpoint with the operation named in the `X-Amz-Target` header. Request
//! signing is expected to happen in front of the endpoint (VPC endpoint
//! proxy or signing sidecar).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::error::GatewayError;
use crate::gateway::StatementGateway;
use crate::model::{
    CancelStatementResponse, ExecuteStatementRequest, ExecuteStatementResponse,
    StatementDescription, StatementResult,
};

const TARGET_PREFIX: &str = "RedshiftData";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Error body returned by the service.
#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(rename = "__type", default)]
    error_type: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// Statement service client over HTTP.
#[derive(Clone)]
pub struct HttpStatementGateway {
    client: Client,
    endpoint: String,
}

impl HttpStatementGateway {
    /// Create a new client for the given endpoint.
    pub fn new(endpoint: &str) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(30))
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn target(operation: &str) -> String {
        format!("{}.{}", TARGET_PREFIX, operation)
    }

    /// Invoke one operation and decode its response.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        tracing::debug!(operation, endpoint = %self.endpoint, "Calling statement service");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Target", Self::target(operation))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::Json(format!("Failed to parse {} response: {}", operation, e)));
        }

        let text = response.text().await.unwrap_or_default();
        Err(Self::map_error(status, &text))
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return GatewayError::Throttled(body.to_string());
        }

        match serde_json::from_str::<ServiceError>(body) {
            Ok(err) if !err.error_type.is_empty() => GatewayError::from_service(&err.error_type, err.message),
            _ if status == StatusCode::NOT_FOUND => GatewayError::NotFound(body.to_string()),
            _ => GatewayError::Rejected(format!("Status {}: {}", status, body)),
        }
    }
}

#[async_trait]
impl StatementGateway for HttpStatementGateway {
    async fn execute_statement(&self, request: &ExecuteStatementRequest) -> Result<String, GatewayError> {
        let body = serde_json::to_value(request)?;
        let response: ExecuteStatementResponse = self.call("ExecuteStatement", body).await?;

        tracing::info!(
            statement_id = %response.id,
            statement_name = %request.statement_name,
            with_event = request.with_event,
            "Statement issued"
        );

        Ok(response.id)
    }

    async fn describe_statement(&self, statement_id: &str) -> Result<StatementDescription, GatewayError> {
        self.call("DescribeStatement", serde_json::json!({ "Id": statement_id }))
            .await
    }

    async fn cancel_statement(&self, statement_id: &str) -> Result<bool, GatewayError> {
        let response: CancelStatementResponse = self
            .call("CancelStatement", serde_json::json!({ "Id": statement_id }))
            .await?;
        Ok(response.status)
    }

    async fn get_statement_result(
        &self,
        statement_id: &str,
        next_token: Option<&str>,
    ) -> Result<StatementResult, GatewayError> {
        let mut body = serde_json::json!({ "Id": statement_id });
        if let Some(token) = next_token {
            body["NextToken"] = serde_json::Value::String(token.to_string());
        }
        self.call("GetStatementResult", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let gateway = HttpStatementGateway::new("http://localhost:4566/");
        assert_eq!(gateway.endpoint, "http://localhost:4566");
    }

    #[test]
    fn test_target_header() {
        assert_eq!(
            HttpStatementGateway::target("DescribeStatement"),
            "RedshiftData.DescribeStatement"
        );
    }

    #[test]
    fn test_map_error_throttled_by_status() {
        let err = HttpStatementGateway::map_error(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_throttled());
    }

    #[test]
    fn test_map_error_by_service_type() {
        let body = r#"{"__type":"ActiveStatementsExceededException","message":"limit"}"#;
        let err = HttpStatementGateway::map_error(StatusCode::BAD_REQUEST, body);
        assert!(err.is_throttled());

        let body = r#"{"__type":"ResourceNotFoundException","Message":"Query does not exist"}"#;
        let err = HttpStatementGateway::map_error(StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, GatewayError::NotFound(ref m) if m == "Query does not exist"));
    }

    #[test]
    fn test_map_error_unstructured_body() {
        let err = HttpStatementGateway::map_error(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, GatewayError::Rejected(ref m) if m.contains("boom")));
    }
}
