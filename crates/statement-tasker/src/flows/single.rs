//! Single-request flows.

use async_trait::async_trait;

use super::{Flow, FlowOutcome, FlowRuntime, FlowTrace, WaitMode};
use crate::error::TaskerError;

/// Error code of a statement that ended in `FAILED`.
const STATEMENT_FAILED: &str = "FAILED";

fn is_statement_failure(error: &TaskerError) -> bool {
    matches!(error, TaskerError::TaskFailed { error, .. } if error == STATEMENT_FAILED)
}

/// Run one statement, then fetch its result.
pub struct SingleSuccessFlow {
    sql: String,
}

impl SingleSuccessFlow {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

#[async_trait]
impl Flow for SingleSuccessFlow {
    fn name(&self) -> &str {
        "single-success"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());

        trace.visit("ExecuteStatement");
        if let Err(e) = runtime
            .run_and_wait(execution_id, &self.sql, WaitMode::Callback, runtime.heartbeat())
            .await
        {
            return trace.fail(&e);
        }

        trace.visit("GetStatementResult");
        match runtime.result_latest(execution_id).await {
            Ok(result) => trace.succeed(result),
            Err(e) => trace.fail(&e),
        }
    }
}

/// Run a statement that is expected to fail, then describe it.
pub struct SingleFailureFlow {
    sql: String,
}

impl SingleFailureFlow {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

#[async_trait]
impl Flow for SingleFailureFlow {
    fn name(&self) -> &str {
        "single-failure"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());

        trace.visit("ExecuteStatement");
        match runtime
            .run_and_wait(execution_id, &self.sql, WaitMode::Callback, runtime.heartbeat())
            .await
        {
            Ok(output) => return trace.finish("UnexpectedSuccess", false, output),
            Err(e) if is_statement_failure(&e) => {}
            Err(e) => return trace.fail(&e),
        }

        trace.visit("DescribeStatement");
        match runtime.describe_latest(execution_id).await {
            Ok(description) => trace.succeed(serde_json::to_value(description).unwrap_or_default()),
            Err(e) => trace.fail(&e),
        }
    }
}

/// Run a valid statement, then an invalid one that must fail.
pub struct SuccessAndFailFlow {
    valid_sql: String,
    invalid_sql: String,
}

impl SuccessAndFailFlow {
    pub fn new(valid_sql: impl Into<String>, invalid_sql: impl Into<String>) -> Self {
        Self {
            valid_sql: valid_sql.into(),
            invalid_sql: invalid_sql.into(),
        }
    }
}

#[async_trait]
impl Flow for SuccessAndFailFlow {
    fn name(&self) -> &str {
        "success-and-fail"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());

        trace.visit("ExecuteValidStatement");
        let first = match runtime
            .run_and_wait(execution_id, &self.valid_sql, WaitMode::Callback, runtime.heartbeat())
            .await
        {
            Ok(output) => output,
            Err(e) => return trace.fail(&e),
        };

        trace.visit("ExecuteInvalidStatement");
        match runtime
            .run_and_wait(execution_id, &self.invalid_sql, WaitMode::Callback, runtime.heartbeat())
            .await
        {
            Ok(output) => trace.finish("UnexpectedSuccess", false, output),
            Err(e) if is_statement_failure(&e) => trace.succeed(serde_json::json!({
                "valid": first,
                "invalid": super::error_output(&e),
            })),
            Err(e) => trace.fail(&e),
        }
    }
}
