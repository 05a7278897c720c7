//! Flow runtime: the run-and-wait primitive and task invocations.

use statement_api::StatementDescription;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskerError;
use crate::invocation::{Action, InvocationRequest, InvocationRouter};
use crate::signal::{CallbackHub, TaskOutcome};
use crate::starter::{StartMode, StartRequest, StartedStatement, Starter};

/// How `run_and_wait` starts its statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitMode {
    Callback,
    /// Singleton start; the key defaults to the SQL text.
    Singleton(Option<String>),
}

/// Shared services the flows run against.
#[derive(Clone)]
pub struct FlowRuntime {
    hub: CallbackHub,
    starter: Arc<Starter>,
    router: InvocationRouter,
    heartbeat: Duration,
    poll_interval: Duration,
}

impl FlowRuntime {
    pub fn new(
        hub: CallbackHub,
        starter: Arc<Starter>,
        router: InvocationRouter,
        heartbeat: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            hub,
            starter,
            router,
            heartbeat,
            poll_interval,
        }
    }

    /// Default heartbeat timeout for callback waits.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn hub(&self) -> &CallbackHub {
        &self.hub
    }

    /// Start a statement with a fresh callback token and wait for the callback.
    ///
    /// If no signal arrives within `heartbeat` the token is cancelled, so a
    /// late signal is rejected as expired, and `Timeout` is returned.
    pub async fn run_and_wait(
        &self,
        execution_id: &str,
        sql: &str,
        mode: WaitMode,
        heartbeat: Duration,
    ) -> Result<serde_json::Value, TaskerError> {
        let pending = self.hub.register().await;
        let token = pending.token.clone();

        let (mode, singleton_key) = match mode {
            WaitMode::Callback => (StartMode::AwaitCallback, None),
            WaitMode::Singleton(key) => (StartMode::Singleton, key),
        };

        let started = self
            .starter
            .start(StartRequest {
                execution_id: Some(execution_id.to_string()),
                invocation_id: None,
                callback_token: Some(token.clone()),
                sql: sql.to_string(),
                mode,
                singleton_key,
            })
            .await;

        let started = match started {
            Ok(started) => started,
            Err(e) => {
                self.hub.cancel(&token).await;
                return Err(e);
            }
        };

        tracing::debug!(
            execution_id,
            statement_id = %started.statement_id,
            heartbeat_secs = heartbeat.as_secs(),
            "Waiting for callback"
        );

        match tokio::time::timeout(heartbeat, pending.receiver).await {
            Ok(Ok(TaskOutcome::Success(output))) => Ok(output),
            Ok(Ok(TaskOutcome::Failure(failure))) => Err(TaskerError::TaskFailed {
                error: failure.error,
                cause: failure.cause,
            }),
            Ok(Err(_)) => Err(TaskerError::Signal(format!(
                "callback for {} was dropped",
                started.statement_id
            ))),
            Err(_) => {
                self.hub.cancel(&token).await;
                tracing::warn!(execution_id, statement_id = %started.statement_id, "Heartbeat timed out");
                Err(TaskerError::Timeout(format!(
                    "no callback for statement {} within {:?}",
                    started.statement_id, heartbeat
                )))
            }
        }
    }

    /// Start a statement without a callback.
    pub async fn start(&self, execution_id: &str, sql: &str) -> Result<StartedStatement, TaskerError> {
        self.starter
            .start(StartRequest::fire_and_forget(Some(execution_id.to_string()), sql))
            .await
    }

    /// Describe a statement by id.
    pub async fn describe(&self, statement_id: &str) -> Result<StatementDescription, TaskerError> {
        let request = InvocationRequest {
            action: Some(Action::DescribeStatement),
            statement_id: Some(statement_id.to_string()),
            ..Default::default()
        };
        Ok(serde_json::from_value(self.router.handle(request).await?)?)
    }

    /// Describe the statement of the latest invocation of an execution.
    pub async fn describe_latest(&self, execution_id: &str) -> Result<StatementDescription, TaskerError> {
        let request = InvocationRequest::latest(Action::DescribeStatement, execution_id);
        Ok(serde_json::from_value(self.router.handle(request).await?)?)
    }

    /// First result page of the latest invocation of an execution.
    pub async fn result_latest(&self, execution_id: &str) -> Result<serde_json::Value, TaskerError> {
        let request = InvocationRequest::latest(Action::GetStatementResult, execution_id);
        self.router.handle(request).await
    }

    /// Cancel the statement of the latest invocation of an execution.
    pub async fn cancel_latest(&self, execution_id: &str) -> Result<bool, TaskerError> {
        let request = InvocationRequest::latest(Action::CancelStatement, execution_id);
        let response = self.router.handle(request).await?;
        Ok(response["Status"].as_bool().unwrap_or(false))
    }
}
