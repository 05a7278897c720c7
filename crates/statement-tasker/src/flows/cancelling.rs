//! Cancelling flow: cancel a statement that outlives its heartbeat.

use async_trait::async_trait;
use statement_api::StatementStatus;
use std::time::Duration;

use super::{Flow, FlowOutcome, FlowRuntime, FlowTrace, WaitMode};
use crate::error::TaskerError;

/// Run a long statement with a short heartbeat and cancel it on timeout.
///
/// Succeeds only when the statement ends up `ABORTED`. A statement that
/// finishes before the heartbeat, or races the cancel to `FINISHED`, fails
/// the flow.
pub struct CancellingFlow {
    setup_sql: Option<String>,
    sql: String,
    heartbeat: Duration,
}

impl CancellingFlow {
    pub fn new(sql: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            setup_sql: None,
            sql: sql.into(),
            heartbeat,
        }
    }

    /// Statement awaited before the long one, e.g. to create its input table.
    pub fn with_setup(mut self, setup_sql: impl Into<String>) -> Self {
        self.setup_sql = Some(setup_sql.into());
        self
    }
}

#[async_trait]
impl Flow for CancellingFlow {
    fn name(&self) -> &str {
        "cancelling"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());

        if let Some(setup_sql) = &self.setup_sql {
            trace.visit("Setup");
            if let Err(e) = runtime
                .run_and_wait(execution_id, setup_sql, WaitMode::Callback, runtime.heartbeat())
                .await
            {
                return trace.fail(&e);
            }
        }

        trace.visit("ExecuteLongStatement");
        match runtime
            .run_and_wait(execution_id, &self.sql, WaitMode::Callback, self.heartbeat)
            .await
        {
            Ok(output) => return trace.finish("CompletedBeforeTimeout", false, output),
            Err(TaskerError::Timeout(_)) => {}
            Err(e) => return trace.fail(&e),
        }

        trace.visit("CancelStatement");
        match runtime.cancel_latest(execution_id).await {
            Ok(true) => {}
            Ok(false) => {
                return trace.finish(
                    "CancelFailed",
                    false,
                    serde_json::json!({ "Status": false }),
                )
            }
            Err(e) => return trace.fail(&e),
        }

        loop {
            trace.visit("DescribeStatement");
            let description = match runtime.describe_latest(execution_id).await {
                Ok(description) => description,
                Err(e) => return trace.fail(&e),
            };

            let output = serde_json::to_value(&description).unwrap_or_default();
            match description.status {
                StatementStatus::Aborted => return trace.succeed(output),
                status if status.is_active() => {
                    trace.visit("Wait");
                    tokio::time::sleep(runtime.poll_interval()).await;
                }
                _ => return trace.finish(super::FAIL, false, output),
            }
        }
    }
}
