//! Gateway trait over the statement service.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::model::{ExecuteStatementRequest, StatementDescription, StatementResult};

/// Thin client over the execute / describe / cancel / get-result operations.
///
/// Implementations carry no orchestration logic; retries are applied by callers.
#[async_trait]
pub trait StatementGateway: Send + Sync {
    /// Issue a statement, returning the service-assigned statement id.
    async fn execute_statement(&self, request: &ExecuteStatementRequest) -> Result<String, GatewayError>;

    /// Describe the current state of a statement.
    async fn describe_statement(&self, statement_id: &str) -> Result<StatementDescription, GatewayError>;

    /// Request cancellation. Returns `false` when the statement could not be cancelled.
    async fn cancel_statement(&self, statement_id: &str) -> Result<bool, GatewayError>;

    /// Fetch one page of a statement's result set.
    async fn get_statement_result(
        &self,
        statement_id: &str,
        next_token: Option<&str>,
    ) -> Result<StatementResult, GatewayError>;
}
