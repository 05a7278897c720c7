//! Parallel singleton flow.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{Flow, FlowOutcome, FlowRuntime, FlowTrace, WaitMode};
use crate::error::TaskerError;

/// Runs the same singleton statement in several branches.
///
/// A branch that finds the statement already running ends in
/// `alreadyRunning{i}`, which counts as success. The flow succeeds when every
/// branch does.
pub struct ParallelSingletonFlow {
    sql: String,
    branches: usize,
    max_concurrency: usize,
    singleton_key: Option<String>,
    heartbeat: Option<Duration>,
}

impl ParallelSingletonFlow {
    pub fn new(sql: impl Into<String>, branches: usize, max_concurrency: usize) -> Self {
        Self {
            sql: sql.into(),
            branches,
            max_concurrency: max_concurrency.max(1),
            singleton_key: None,
            heartbeat: None,
        }
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    async fn run_branch(&self, runtime: &FlowRuntime, execution_id: &str, index: usize) -> (String, bool, serde_json::Value) {
        let heartbeat = self.heartbeat.unwrap_or_else(|| runtime.heartbeat());
        let branch_execution = format!("{}/branch{}", execution_id, index);

        match runtime
            .run_and_wait(
                &branch_execution,
                &self.sql,
                WaitMode::Singleton(self.singleton_key.clone()),
                heartbeat,
            )
            .await
        {
            Ok(output) => (format!("successParallel{}", index), true, output),
            Err(e @ TaskerError::ConcurrentExecution(_)) => {
                (format!("alreadyRunning{}", index), true, super::error_output(&e))
            }
            Err(e) => (format!("failed{}", index), false, super::error_output(&e)),
        }
    }
}

#[async_trait]
impl Flow for ParallelSingletonFlow {
    fn name(&self) -> &str {
        "parallel-singleton"
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(self.name());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        let branches = (0..self.branches).map(|index| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                self.run_branch(runtime, execution_id, index).await
            }
        });
        let results = join_all(branches).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut all_succeeded = true;
        for (terminal, succeeded, output) in results {
            trace.visit(terminal.clone());
            all_succeeded &= succeeded;
            outputs.push(serde_json::json!({
                "Terminal": terminal,
                "Succeeded": succeeded,
                "Output": output,
            }));
        }

        let output = serde_json::Value::Array(outputs);
        if all_succeeded {
            trace.succeed(output)
        } else {
            trace.finish(super::FAIL, false, output)
        }
    }
}
