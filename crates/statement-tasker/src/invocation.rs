//! Workflow task invocation interface.
//!
//! Workflow tasks call the tasker with a loosely typed request object. The
//! router validates it, resolves `LATEST` statement ids and dispatches to
//! the starter or straight to the statement service.

use serde::{Deserialize, Serialize};
use statement_api::StatementGateway;
use std::sync::Arc;

use crate::error::TaskerError;
use crate::retry::{retry_throttled, RetryPolicy};
use crate::starter::{StartMode, StartRequest, Starter};
use crate::store::TrackingStore;

/// Placeholder statement id for the latest invocation of an execution.
pub const LATEST: &str = "LATEST";

/// Operation requested by a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    ExecuteStatement,
    ExecuteSingletonStatement,
    DescribeStatement,
    GetStatementResult,
    CancelStatement,
}

/// Request object sent by workflow tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(default, alias = "statement", skip_serializing_if = "Option::is_none")]
    pub sql_statement: Option<String>,

    #[serde(default, alias = "callbackToken", skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,

    #[serde(default, alias = "executionId", skip_serializing_if = "Option::is_none")]
    pub execution_arn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
}

impl InvocationRequest {
    /// Execute `sql`, signalling completion on `token`.
    pub fn execute(execution_arn: &str, token: &str, sql: &str) -> Self {
        Self {
            action: Some(Action::ExecuteStatement),
            sql_statement: Some(sql.to_string()),
            task_token: Some(token.to_string()),
            execution_arn: Some(execution_arn.to_string()),
            ..Default::default()
        }
    }

    /// Run `action` against the statement of the latest invocation of `execution_arn`.
    pub fn latest(action: Action, execution_arn: &str) -> Self {
        Self {
            action: Some(action),
            execution_arn: Some(execution_arn.to_string()),
            statement_id: Some(LATEST.to_string()),
            ..Default::default()
        }
    }

    fn resolved_action(&self) -> Result<Action, TaskerError> {
        match self.action {
            Some(action) => Ok(action),
            None if self.sql_statement.is_some() => Ok(Action::ExecuteStatement),
            None => Err(TaskerError::InvalidRequest(
                "request has neither an action nor a sql statement".to_string(),
            )),
        }
    }
}

/// Response of the execute actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteResponse {
    pub id: String,
    pub statement_name: String,
    pub execution_arn: String,
    pub invocation_id: String,
}

/// Dispatches invocation requests.
#[derive(Clone)]
pub struct InvocationRouter {
    starter: Arc<Starter>,
    store: TrackingStore,
    gateway: Arc<dyn StatementGateway>,
    retry: RetryPolicy,
}

impl InvocationRouter {
    pub fn new(
        starter: Arc<Starter>,
        store: TrackingStore,
        gateway: Arc<dyn StatementGateway>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            starter,
            store,
            gateway,
            retry,
        }
    }

    /// Handle an untyped request object.
    pub async fn handle_value(&self, request: serde_json::Value) -> Result<serde_json::Value, TaskerError> {
        let request: InvocationRequest =
            serde_json::from_value(request).map_err(|e| TaskerError::InvalidRequest(e.to_string()))?;
        self.handle(request).await
    }

    /// Handle a request.
    pub async fn handle(&self, request: InvocationRequest) -> Result<serde_json::Value, TaskerError> {
        let action = request.resolved_action()?;
        tracing::debug!(action = ?action, execution_arn = ?request.execution_arn, "Handling invocation");

        match action {
            Action::ExecuteStatement => self.execute(request, false).await,
            Action::ExecuteSingletonStatement => self.execute(request, true).await,
            Action::DescribeStatement => {
                let statement_id = self.resolve_statement_id(&request).await?;
                let description = retry_throttled(&self.retry, "describe_statement", || {
                    self.gateway.describe_statement(&statement_id)
                })
                .await?;
                Ok(serde_json::to_value(description)?)
            }
            Action::GetStatementResult => {
                let statement_id = self.resolve_statement_id(&request).await?;
                let next_token = request.next_token.as_deref();
                let result = retry_throttled(&self.retry, "get_statement_result", || {
                    self.gateway.get_statement_result(&statement_id, next_token)
                })
                .await?;
                Ok(serde_json::to_value(result)?)
            }
            Action::CancelStatement => {
                let statement_id = self.resolve_statement_id(&request).await?;
                let cancelled = retry_throttled(&self.retry, "cancel_statement", || {
                    self.gateway.cancel_statement(&statement_id)
                })
                .await?;
                tracing::info!(statement_id = %statement_id, cancelled, "Cancel requested");
                Ok(serde_json::json!({ "Status": cancelled }))
            }
        }
    }

    async fn execute(&self, request: InvocationRequest, singleton: bool) -> Result<serde_json::Value, TaskerError> {
        let sql = request
            .sql_statement
            .ok_or_else(|| TaskerError::InvalidRequest("sqlStatement is required".to_string()))?;

        let mode = match (singleton, request.task_token.is_some()) {
            (true, _) => StartMode::Singleton,
            (false, true) => StartMode::AwaitCallback,
            (false, false) => StartMode::FireAndForget,
        };

        let started = self
            .starter
            .start(StartRequest {
                execution_id: request.execution_arn,
                invocation_id: request.invocation_id,
                callback_token: request.task_token,
                sql,
                mode,
                singleton_key: request.singleton_key,
            })
            .await?;

        Ok(serde_json::to_value(ExecuteResponse {
            id: started.statement_id,
            statement_name: started.statement_name,
            execution_arn: started.key.execution_id,
            invocation_id: started.key.invocation_id,
        })?)
    }

    /// Resolve the target statement id, expanding `LATEST`.
    pub async fn resolve_statement_id(&self, request: &InvocationRequest) -> Result<String, TaskerError> {
        let statement_id = request
            .statement_id
            .as_deref()
            .ok_or_else(|| TaskerError::InvalidRequest("statementId is required".to_string()))?;

        if statement_id != LATEST {
            return Ok(statement_id.to_string());
        }

        let execution_arn = request
            .execution_arn
            .as_deref()
            .ok_or_else(|| TaskerError::InvalidRequest("executionArn is required with LATEST".to_string()))?;

        self.latest_statement_id(execution_arn).await
    }

    /// Statement id of the latest invocation of an execution.
    pub async fn latest_statement_id(&self, execution_arn: &str) -> Result<String, TaskerError> {
        let latest = retry_throttled(&self.retry, "latest_record", || self.store.latest_record(execution_arn)).await?;

        latest.and_then(|record| record.statement_id).ok_or_else(|| {
            TaskerError::PreviousExecutionNotFound(format!(
                "no issued statement found for execution {}",
                execution_arn
            ))
        })
    }
}
