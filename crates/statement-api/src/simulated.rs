//! Scripted in-memory statement service.
//!
//! Each issued statement follows a status script chosen by its SQL text
//! (default `STARTED -> FINISHED`). Statements issued with `with_event`
//! progress on their own, one script step per `step_delay`, and publish a
//! status change notification on the feed when they reach a terminal
//! state. Statements issued without events only progress when described:
//! each describe call reports the current step, then moves to the next.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::error::GatewayError;
use crate::gateway::StatementGateway;
use crate::model::{
    ExecuteStatementRequest, StatementDescription, StatementResult, StatementStatus,
    StatusChangeNotification,
};

/// Snapshot of a simulated statement.
#[derive(Debug, Clone)]
pub struct SimulatedStatement {
    pub id: String,
    pub sql: String,
    pub statement_name: String,
    pub with_event: bool,
    script: Vec<StatementStatus>,
    position: usize,
    notified: bool,
}

impl SimulatedStatement {
    /// Current status.
    pub fn status(&self) -> StatementStatus {
        self.script[self.position]
    }

    fn advance(&mut self) {
        if self.position + 1 < self.script.len() {
            self.position += 1;
        }
    }

    fn set_terminal(&mut self, status: StatementStatus) {
        self.script = vec![status];
        self.position = 0;
    }
}

#[derive(Default)]
struct SimState {
    statements: HashMap<String, SimulatedStatement>,
    scripts: HashMap<String, Vec<StatementStatus>>,
    throttle_executes: u32,
    reject_executes: u32,
    issued: u32,
}

/// In-memory statement service for tests and local runs.
#[derive(Clone)]
pub struct SimulatedGateway {
    state: Arc<Mutex<SimState>>,
    feed: Option<mpsc::UnboundedSender<StatusChangeNotification>>,
    step_delay: Duration,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGateway {
    /// Create a simulator without a notification feed.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            feed: None,
            step_delay: Duration::from_millis(50),
        }
    }

    /// Create a simulator together with the receiving end of its notification feed.
    pub fn with_notifications() -> (Self, mpsc::UnboundedReceiver<StatusChangeNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut gateway = Self::new();
        gateway.feed = Some(tx);
        (gateway, rx)
    }

    /// Set how long event-driven statements stay on each script step.
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    /// Use `statuses` as the script for statements with this exact SQL text.
    ///
    /// The first status is the one reported right after issue.
    pub async fn script(&self, sql: &str, statuses: Vec<StatementStatus>) {
        assert!(!statuses.is_empty(), "status script must not be empty");
        self.state.lock().await.scripts.insert(sql.to_string(), statuses);
    }

    /// Reject the next `count` execute calls as throttled.
    pub async fn throttle_next_executes(&self, count: u32) {
        self.state.lock().await.throttle_executes = count;
    }

    /// Reject the next `count` execute calls with a validation error.
    pub async fn reject_next_executes(&self, count: u32) {
        self.state.lock().await.reject_executes = count;
    }

    /// Number of statements successfully issued.
    pub async fn issued_count(&self) -> u32 {
        self.state.lock().await.issued
    }

    /// Snapshot of all issued statements.
    pub async fn statements(&self) -> Vec<SimulatedStatement> {
        self.state.lock().await.statements.values().cloned().collect()
    }

    /// Snapshot of one statement.
    pub async fn statement(&self, statement_id: &str) -> Option<SimulatedStatement> {
        self.state.lock().await.statements.get(statement_id).cloned()
    }

    /// Force a statement into a terminal status, notifying if it was issued with events.
    pub async fn complete(&self, statement_id: &str, status: StatementStatus) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let statement = state
            .statements
            .get_mut(statement_id)
            .ok_or_else(|| GatewayError::NotFound(statement_id.to_string()))?;
        statement.set_terminal(status);
        self.notify(statement);
        Ok(())
    }

    fn notify(&self, statement: &mut SimulatedStatement) {
        if !statement.with_event || statement.notified || !statement.status().is_terminal() {
            return;
        }
        statement.notified = true;

        if let Some(feed) = &self.feed {
            let notification = StatusChangeNotification::new(
                &statement.id,
                Some(&statement.statement_name),
                statement.status(),
            );
            if feed.send(notification).is_err() {
                tracing::warn!(statement_id = %statement.id, "Notification feed closed");
            }
        }
    }

    /// Walk an event-driven statement through its script.
    fn spawn_progress(&self, statement_id: String) {
        let gateway = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(gateway.step_delay).await;

                let mut state = gateway.state.lock().await;
                let Some(statement) = state.statements.get_mut(&statement_id) else {
                    break;
                };
                if statement.notified {
                    break;
                }
                if statement.status().is_active() {
                    statement.advance();
                }
                if statement.status().is_terminal() {
                    gateway.notify(statement);
                    break;
                }
                if statement.position + 1 == statement.script.len() {
                    // Parked on an active status until cancelled or completed.
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl StatementGateway for SimulatedGateway {
    async fn execute_statement(&self, request: &ExecuteStatementRequest) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;

        if state.throttle_executes > 0 {
            state.throttle_executes -= 1;
            return Err(GatewayError::Throttled("Rate exceeded".to_string()));
        }
        if state.reject_executes > 0 {
            state.reject_executes -= 1;
            return Err(GatewayError::Rejected(
                "ValidationException: simulated rejection".to_string(),
            ));
        }

        let script = state
            .scripts
            .get(&request.sql)
            .cloned()
            .unwrap_or_else(|| vec![StatementStatus::Started, StatementStatus::Finished]);

        let id = uuid::Uuid::new_v4().to_string();
        state.statements.insert(
            id.clone(),
            SimulatedStatement {
                id: id.clone(),
                sql: request.sql.clone(),
                statement_name: request.statement_name.clone(),
                with_event: request.with_event,
                script,
                position: 0,
                notified: false,
            },
        );
        state.issued += 1;
        drop(state);

        tracing::debug!(statement_id = %id, statement_name = %request.statement_name, "Simulated statement issued");

        if request.with_event {
            self.spawn_progress(id.clone());
        }

        Ok(id)
    }

    async fn describe_statement(&self, statement_id: &str) -> Result<StatementDescription, GatewayError> {
        let mut state = self.state.lock().await;
        let statement = state
            .statements
            .get_mut(statement_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Query {} does not exist", statement_id)))?;

        let status = statement.status();
        let description = StatementDescription {
            id: statement.id.clone(),
            status,
            error: (status == StatementStatus::Failed)
                .then(|| format!("ERROR: simulated failure of '{}'", statement.sql)),
            query_string: Some(statement.sql.clone()),
            has_result_set: Some(status == StatementStatus::Finished),
            result_rows: (status == StatementStatus::Finished).then_some(1),
            extra: serde_json::Map::new(),
        };

        if !statement.with_event {
            statement.advance();
        }
        Ok(description)
    }

    async fn cancel_statement(&self, statement_id: &str) -> Result<bool, GatewayError> {
        let mut state = self.state.lock().await;
        let statement = state
            .statements
            .get_mut(statement_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Query {} does not exist", statement_id)))?;

        if statement.status().is_terminal() {
            return Ok(false);
        }

        statement.set_terminal(StatementStatus::Aborted);
        self.notify(statement);
        Ok(true)
    }

    async fn get_statement_result(
        &self,
        statement_id: &str,
        _next_token: Option<&str>,
    ) -> Result<StatementResult, GatewayError> {
        let state = self.state.lock().await;
        let statement = state
            .statements
            .get(statement_id)
            .ok_or_else(|| GatewayError::NotFound(format!("Query {} does not exist", statement_id)))?;

        if statement.status() != StatementStatus::Finished {
            return Err(GatewayError::Rejected(format!(
                "ValidationException: Query {} is {}, results are not available",
                statement_id,
                statement.status()
            )));
        }

        Ok(StatementResult {
            records: vec![vec![serde_json::json!({ "stringValue": statement.id })]],
            column_metadata: vec![serde_json::json!({ "name": "statement_id", "typeName": "varchar" })],
            total_num_rows: 1,
            next_token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StatementTarget;

    fn request(sql: &str, with_event: bool) -> ExecuteStatementRequest {
        ExecuteStatementRequest {
            sql: sql.to_string(),
            statement_name: "exec-1:1700000000.000001".to_string(),
            with_event,
            target: StatementTarget::default(),
        }
    }

    #[tokio::test]
    async fn test_polled_statement_advances_per_describe() {
        let gateway = SimulatedGateway::new();
        gateway
            .script(
                "select 1",
                vec![StatementStatus::Started, StatementStatus::Started, StatementStatus::Finished],
            )
            .await;

        let id = gateway.execute_statement(&request("select 1", false)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(gateway.describe_statement(&id).await.unwrap().status);
        }
        assert_eq!(
            seen,
            vec![
                StatementStatus::Started,
                StatementStatus::Started,
                StatementStatus::Finished,
                StatementStatus::Finished,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_statement_notifies_once() {
        let (gateway, mut feed) = SimulatedGateway::with_notifications();
        let id = gateway.execute_statement(&request("select 1", true)).await.unwrap();

        let notification = feed.recv().await.unwrap();
        assert_eq!(notification.detail.statement_id, id);
        assert_eq!(notification.detail.state, StatementStatus::Finished);
        assert_eq!(
            notification.detail.statement_name.as_deref(),
            Some("exec-1:1700000000.000001")
        );

        // Completing again must not produce a second notification.
        gateway.complete(&id, StatementStatus::Finished).await.unwrap();
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_active_and_finished() {
        let (gateway, mut feed) = SimulatedGateway::with_notifications();
        gateway.script("slow", vec![StatementStatus::Started]).await;

        let id = gateway.execute_statement(&request("slow", true)).await.unwrap();
        assert!(gateway.cancel_statement(&id).await.unwrap());
        assert_eq!(feed.recv().await.unwrap().detail.state, StatementStatus::Aborted);

        // Already terminal
        assert!(!gateway.cancel_statement(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_throttled_executes_do_not_issue() {
        let gateway = SimulatedGateway::new();
        gateway.throttle_next_executes(2).await;

        assert!(gateway.execute_statement(&request("select 1", false)).await.unwrap_err().is_throttled());
        assert!(gateway.execute_statement(&request("select 1", false)).await.unwrap_err().is_throttled());
        assert!(gateway.execute_statement(&request("select 1", false)).await.is_ok());
        assert_eq!(gateway.issued_count().await, 1);
    }

    #[tokio::test]
    async fn test_result_requires_finished_statement() {
        let gateway = SimulatedGateway::new();
        gateway.script("slow", vec![StatementStatus::Started]).await;
        let id = gateway.execute_statement(&request("slow", false)).await.unwrap();

        assert!(matches!(
            gateway.get_statement_result(&id, None).await,
            Err(GatewayError::Rejected(_))
        ));

        gateway.complete(&id, StatementStatus::Finished).await.unwrap();
        let result = gateway.get_statement_result(&id, None).await.unwrap();
        assert_eq!(result.total_num_rows, 1);
    }

    #[tokio::test]
    async fn test_unknown_statement() {
        let gateway = SimulatedGateway::new();
        assert!(matches!(
            gateway.describe_statement("missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
