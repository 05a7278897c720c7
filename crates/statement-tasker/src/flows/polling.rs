//! Polling flow: fire-and-forget start, then describe until terminal.

use async_trait::async_trait;
use statement_api::StatementStatus;

use super::{Flow, FlowOutcome, FlowRuntime, FlowTrace};

/// Start a statement without a callback and poll its status.
///
/// Polls until the statement is terminal; there is no upper bound.
pub struct PollingFlow {
    sql: String,
}

impl PollingFlow {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

#[async_trait]
impl Flow for PollingFlow {
    fn name(&self) -> &str {
        "polling"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());

        trace.visit("ExecuteStatement");
        let started = match runtime.start(execution_id, &self.sql).await {
            Ok(started) => started,
            Err(e) => return trace.fail(&e),
        };

        loop {
            trace.visit("Wait");
            tokio::time::sleep(runtime.poll_interval()).await;

            trace.visit("DescribeStatement");
            let description = match runtime.describe(&started.statement_id).await {
                Ok(description) => description,
                Err(e) => return trace.fail(&e),
            };

            let output = serde_json::to_value(&description).unwrap_or_default();
            match description.status {
                StatementStatus::Finished => return trace.succeed(output),
                StatementStatus::Failed | StatementStatus::Aborted => {
                    return trace.finish(super::FAIL, false, output)
                }
                _ => {}
            }
        }
    }
}
