//! Orchestration patterns over the callback primitive.
//!
//! Each flow is a small state machine driven by [`FlowRuntime`]. Flows never
//! return errors: every path ends in a named terminal state recorded in the
//! [`FlowOutcome`].

mod cancelling;
mod chained;
mod parallel;
mod polling;
mod runtime;
mod single;

pub use cancelling::CancellingFlow;
pub use chained::{ChainBuilder, ChainedFlow};
pub use parallel::ParallelSingletonFlow;
pub use polling::PollingFlow;
pub use runtime::{FlowRuntime, WaitMode};
pub use single::{SingleFailureFlow, SingleSuccessFlow, SuccessAndFailFlow};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskerError;

/// Terminal state names shared by the flows.
pub const SUCCESS: &str = "Success";
pub const FAIL: &str = "Fail";

/// Result of running a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub flow: String,
    pub terminal: String,
    pub succeeded: bool,
    pub output: serde_json::Value,
    /// States visited, in order.
    pub trace: Vec<String>,
}

/// A runnable orchestration.
#[async_trait]
pub trait Flow: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome;
}

/// Records visited states while a flow runs.
#[derive(Debug)]
pub(crate) struct FlowTrace {
    flow: String,
    states: Vec<String>,
}

impl FlowTrace {
    pub(crate) fn new(flow: &str) -> Self {
        Self {
            flow: flow.to_string(),
            states: Vec::new(),
        }
    }

    pub(crate) fn visit(&mut self, state: impl Into<String>) {
        let state = state.into();
        tracing::debug!(flow = %self.flow, state = %state, "Entering state");
        self.states.push(state);
    }

    pub(crate) fn finish(mut self, terminal: &str, succeeded: bool, output: serde_json::Value) -> FlowOutcome {
        self.states.push(terminal.to_string());
        tracing::info!(flow = %self.flow, terminal, succeeded, "Flow finished");
        FlowOutcome {
            flow: self.flow,
            terminal: terminal.to_string(),
            succeeded,
            output,
            trace: self.states,
        }
    }

    pub(crate) fn succeed(self, output: serde_json::Value) -> FlowOutcome {
        self.finish(SUCCESS, true, output)
    }

    pub(crate) fn fail(self, error: &TaskerError) -> FlowOutcome {
        self.finish(FAIL, false, error_output(error))
    }
}

/// Error payload in the workflow's `{Error, Cause}` shape.
pub fn error_output(error: &TaskerError) -> serde_json::Value {
    serde_json::json!({
        "Error": error.error_name(),
        "Cause": error.cause(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_records_terminal() {
        let mut trace = FlowTrace::new("demo");
        trace.visit("ExecuteStatement");
        let outcome = trace.succeed(serde_json::json!({"rows": 1}));

        assert_eq!(outcome.trace, vec!["ExecuteStatement", "Success"]);
        assert!(outcome.succeeded);
        assert_eq!(outcome.terminal, SUCCESS);
    }

    #[test]
    fn test_error_output_shape() {
        let err = TaskerError::TaskFailed {
            error: "FAILED".to_string(),
            cause: "bad sql".to_string(),
        };
        let output = error_output(&err);
        assert_eq!(output["Error"], "FAILED");
        assert_eq!(output["Cause"], "bad sql");
    }
}
