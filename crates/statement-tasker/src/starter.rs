//! Starter: records a pending callback and issues the statement.
//!
//! The record is written before the statement is issued, so a completion can
//! never arrive for an invocation the store does not know about yet. The
//! starter never waits for the statement itself.

use statement_api::{ExecuteStatementRequest, StatementGateway, StatementStatus, StatementTarget};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskerError;
use crate::identity::{adhoc_execution_id, validate_invocation_id, InvocationKey};
use crate::retry::{retry_throttled, RetryPolicy};
use crate::store::{PendingCallbackRecord, ResolutionClaim, SingletonAcquire, TrackingStore};

/// How the caller intends to wait for the statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// No callback; the caller polls.
    FireAndForget,
    /// Completion is signalled on the callback token.
    AwaitCallback,
    /// At most one in-flight statement per singleton key.
    Singleton,
}

/// Request to start a statement.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub execution_id: Option<String>,
    pub invocation_id: Option<String>,
    pub callback_token: Option<String>,
    pub sql: String,
    pub mode: StartMode,
    /// Defaults to the SQL text in singleton mode.
    pub singleton_key: Option<String>,
}

impl StartRequest {
    pub fn fire_and_forget(execution_id: Option<String>, sql: impl Into<String>) -> Self {
        Self {
            execution_id,
            invocation_id: None,
            callback_token: None,
            sql: sql.into(),
            mode: StartMode::FireAndForget,
            singleton_key: None,
        }
    }

    pub fn await_callback(execution_id: impl Into<String>, token: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            invocation_id: None,
            callback_token: Some(token.into()),
            sql: sql.into(),
            mode: StartMode::AwaitCallback,
            singleton_key: None,
        }
    }
}

/// A statement that was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedStatement {
    pub key: InvocationKey,
    pub statement_id: String,
    pub statement_name: String,
}

/// Starts statements on behalf of workflow tasks.
pub struct Starter {
    store: TrackingStore,
    gateway: Arc<dyn StatementGateway>,
    target: StatementTarget,
    retry: RetryPolicy,
    issue_timeout: Duration,
}

impl Starter {
    pub fn new(
        store: TrackingStore,
        gateway: Arc<dyn StatementGateway>,
        target: StatementTarget,
        retry: RetryPolicy,
        issue_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            target,
            retry,
            issue_timeout,
        }
    }

    fn validate(request: &StartRequest) -> Result<(), TaskerError> {
        if request.sql.trim().is_empty() {
            return Err(TaskerError::InvalidRequest("sql statement is empty".to_string()));
        }
        if request.callback_token.is_some() && request.execution_id.is_none() {
            return Err(TaskerError::InvalidRequest(
                "a callback token requires an execution id".to_string(),
            ));
        }
        match request.mode {
            StartMode::AwaitCallback if request.callback_token.is_none() => Err(TaskerError::InvalidRequest(
                "awaiting a callback requires a callback token".to_string(),
            )),
            StartMode::FireAndForget if request.callback_token.is_some() => Err(TaskerError::InvalidRequest(
                "fire-and-forget statements take no callback token".to_string(),
            )),
            _ => match &request.invocation_id {
                Some(id) => validate_invocation_id(id),
                None => Ok(()),
            },
        }
    }

    /// Start a statement.
    pub async fn start(&self, request: StartRequest) -> Result<StartedStatement, TaskerError> {
        Self::validate(&request)?;

        let execution_id = request.execution_id.clone().unwrap_or_else(adhoc_execution_id);
        let key = match &request.invocation_id {
            Some(id) => InvocationKey::new(execution_id, id.clone()),
            None => InvocationKey::generate(execution_id),
        };

        let singleton_key = match request.mode {
            StartMode::Singleton => Some(request.singleton_key.clone().unwrap_or_else(|| request.sql.clone())),
            _ => None,
        };

        let mut record = PendingCallbackRecord::new(
            &key,
            &request.sql,
            request.callback_token.clone(),
            self.store.record_ttl(),
        );
        record.singleton_key = singleton_key.clone();

        retry_throttled(&self.retry, "create_record", || self.store.create_record(&record)).await?;

        // The guard names this record as holder, so the record has to exist
        // before the guard does: a guard without a live holder record is stale.
        if let Some(singleton_key) = &singleton_key {
            let acquired = retry_throttled(&self.retry, "acquire_singleton", || {
                self.store.acquire_singleton(singleton_key, &key)
            })
            .await;

            let refused = match acquired {
                Ok(SingletonAcquire::Acquired) => None,
                Ok(SingletonAcquire::Held(holder)) => {
                    tracing::info!(invocation = %key, holder = %holder, "Singleton statement already running");
                    Some(TaskerError::ConcurrentExecution(format!(
                        "statement is already running for invocation {}",
                        holder
                    )))
                }
                Err(e) => Some(e),
            };
            if let Some(e) = refused {
                self.resolve_failed_issue(&key, &e).await;
                return Err(e);
            }
        }

        let statement_name = key.statement_name();
        let with_event = request.callback_token.is_some() || singleton_key.is_some();
        let statement_id = match self.issue(&request.sql, &statement_name, with_event).await {
            Ok(statement_id) => statement_id,
            Err(e) => {
                tracing::error!(invocation = %key, error = %e, "Failed to issue statement");
                self.resolve_failed_issue(&key, &e).await;
                self.release_singleton(&key, singleton_key.as_deref()).await;
                return Err(e);
            }
        };

        retry_throttled(&self.retry, "attach_statement_id", || {
            self.store.attach_statement_id(&key, &statement_id)
        })
        .await?;

        tracing::info!(
            execution_id = %key.execution_id,
            invocation_id = %key.invocation_id,
            statement_id = %statement_id,
            mode = ?request.mode,
            "Statement started"
        );

        Ok(StartedStatement {
            key,
            statement_id,
            statement_name,
        })
    }

    async fn issue(&self, sql: &str, statement_name: &str, with_event: bool) -> Result<String, TaskerError> {
        let request = ExecuteStatementRequest {
            sql: sql.to_string(),
            statement_name: statement_name.to_string(),
            with_event,
            target: self.target.clone(),
        };

        let issued = tokio::time::timeout(
            self.issue_timeout,
            retry_throttled(&self.retry, "execute_statement", || self.gateway.execute_statement(&request)),
        )
        .await
        .map_err(|_| TaskerError::Timeout(format!("issuing statement exceeded {:?}", self.issue_timeout)))?;

        Ok(issued?)
    }

    /// Mark the record resolved so it no longer blocks its key or a singleton guard.
    async fn resolve_failed_issue(&self, key: &InvocationKey, error: &TaskerError) {
        let detail = serde_json::json!({
            "error": error.error_name(),
            "cause": error.to_string(),
        });

        match self
            .store
            .claim_resolution(key, None, StatementStatus::Failed, detail)
            .await
        {
            Ok(ResolutionClaim::Claimed { .. }) => {
                tracing::debug!(invocation = %key, "Record resolved after failed issue");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(invocation = %key, error = %e, "Failed to resolve record after failed issue");
            }
        }
    }

    async fn release_singleton(&self, key: &InvocationKey, singleton_key: Option<&str>) {
        let Some(singleton_key) = singleton_key else {
            return;
        };
        if let Err(e) = self.store.release_singleton(singleton_key, key).await {
            tracing::warn!(invocation = %key, error = %e, "Failed to release singleton guard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvBackend, KvEntry, MemoryKv};
    use async_trait::async_trait;
    use futures::future::join_all;
    use statement_api::SimulatedGateway;

    fn starter(gateway: &SimulatedGateway) -> (Starter, TrackingStore) {
        let store = TrackingStore::in_memory(Duration::from_secs(3600));
        let starter = Starter::new(
            store.clone(),
            Arc::new(gateway.clone()),
            StatementTarget::default(),
            RetryPolicy::default(),
            Duration::from_secs(29),
        );
        (starter, store)
    }

    #[tokio::test]
    async fn test_start_records_then_attaches_statement() {
        let gateway = SimulatedGateway::new();
        let (starter, store) = starter(&gateway);

        let started = starter
            .start(StartRequest::await_callback("exec-1", "token-1", "select 1"))
            .await
            .unwrap();

        let record = store.get(&started.key).await.unwrap().unwrap().value;
        assert_eq!(record.statement_id.as_deref(), Some(started.statement_id.as_str()));
        assert_eq!(record.callback_token.as_deref(), Some("token-1"));
        assert!(!record.is_resolved());

        let statement = gateway.statement(&started.statement_id).await.unwrap();
        assert!(statement.with_event);
        assert_eq!(statement.statement_name, started.statement_name);
        assert_eq!(started.statement_name, started.key.statement_name());
    }

    #[tokio::test]
    async fn test_fire_and_forget_without_execution() {
        let gateway = SimulatedGateway::new();
        let (starter, _) = starter(&gateway);

        let started = starter.start(StartRequest::fire_and_forget(None, "select 1")).await.unwrap();
        assert!(started.key.execution_id.starts_with("adhoc:"));
        assert!(!gateway.statement(&started.statement_id).await.unwrap().with_event);
    }

    #[tokio::test]
    async fn test_validation() {
        let gateway = SimulatedGateway::new();
        let (starter, _) = starter(&gateway);

        let mut request = StartRequest::await_callback("exec-1", "token-1", "  ");
        assert!(matches!(starter.start(request.clone()).await, Err(TaskerError::InvalidRequest(_))));

        request.sql = "select 1".to_string();
        request.execution_id = None;
        assert!(matches!(starter.start(request.clone()).await, Err(TaskerError::InvalidRequest(_))));

        request.execution_id = Some("exec-1".to_string());
        request.invocation_id = Some("yesterday".to_string());
        assert!(matches!(starter.start(request).await, Err(TaskerError::InvalidRequest(_))));
        assert_eq!(gateway.issued_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_invocation_conflicts() {
        let gateway = SimulatedGateway::new();
        let (starter, _) = starter(&gateway);

        let mut request = StartRequest::await_callback("exec-1", "token-1", "select 1");
        request.invocation_id = Some(crate::identity::invocation_id_at(chrono::Utc::now()));

        starter.start(request.clone()).await.unwrap();
        assert!(matches!(starter.start(request).await, Err(TaskerError::Conflict(_))));
        assert_eq!(gateway.issued_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_issue_is_retried() {
        let gateway = SimulatedGateway::new();
        let (starter, _) = starter(&gateway);
        gateway.throttle_next_executes(3).await;

        let started = starter
            .start(StartRequest::await_callback("exec-1", "token-1", "select 1"))
            .await
            .unwrap();
        assert!(!started.statement_id.is_empty());
        assert_eq!(gateway.issued_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_issue_leaves_no_pending_record() {
        let gateway = SimulatedGateway::new();
        let (starter, store) = starter(&gateway);
        gateway.reject_next_executes(1).await;

        let mut request = StartRequest::await_callback("exec-1", "token-1", "select 1");
        request.mode = StartMode::Singleton;
        let err = starter.start(request.clone()).await.unwrap_err();
        assert!(matches!(err, TaskerError::Gateway(_)));

        let latest = store.latest_record("exec-1").await.unwrap().unwrap();
        assert_eq!(latest.resolution.unwrap().status, StatementStatus::Failed);

        // Guard was released: the next singleton start goes through.
        starter.start(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_singleton_rejects_concurrent_start() {
        let gateway = SimulatedGateway::new();
        let (starter, _) = starter(&gateway);

        let mut first = StartRequest::await_callback("exec-1", "token-1", "select 1");
        first.mode = StartMode::Singleton;
        let mut second = StartRequest::await_callback("exec-2", "token-2", "select 1");
        second.mode = StartMode::Singleton;

        starter.start(first).await.unwrap();
        let err = starter.start(second).await.unwrap_err();
        assert_eq!(err.error_name(), "ConcurrentExecution");
        assert_eq!(gateway.issued_count().await, 1);
    }

    /// Backend whose record writes take a while, so concurrent starts interleave.
    struct SlowRecordKv {
        inner: MemoryKv,
        latency: Duration,
    }

    #[async_trait]
    impl KvBackend for SlowRecordKv {
        async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>, TaskerError> {
            if key.starts_with("pending.") {
                tokio::time::sleep(self.latency).await;
            }
            self.inner.create(key, value).await
        }

        async fn entry(&self, key: &str) -> Result<Option<KvEntry>, TaskerError> {
            tokio::task::yield_now().await;
            self.inner.entry(key).await
        }

        async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<Option<u64>, TaskerError> {
            self.inner.update(key, value, revision).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, TaskerError> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_singleton_starts_with_slow_store() {
        let gateway = SimulatedGateway::new();
        let backend = SlowRecordKv {
            inner: MemoryKv::new(),
            latency: Duration::from_millis(20),
        };
        let store = TrackingStore::new(Arc::new(backend), Duration::from_secs(3600));
        let starter = Starter::new(
            store.clone(),
            Arc::new(gateway.clone()),
            StatementTarget::default(),
            RetryPolicy::default(),
            Duration::from_secs(29),
        );

        let starts = (0..5).map(|i| {
            let mut request = StartRequest::await_callback(format!("exec-{}", i), format!("token-{}", i), "select 1");
            request.mode = StartMode::Singleton;
            starter.start(request)
        });
        let results = join_all(starts).await;

        let started = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(TaskerError::ConcurrentExecution(_))))
            .count();
        assert_eq!((started, refused), (1, 4));
        assert_eq!(gateway.issued_count().await, 1);

        // Refused starts leave no pending record behind.
        for (i, result) in results.iter().enumerate() {
            let record = store.latest_record(&format!("exec-{}", i)).await.unwrap().unwrap();
            assert_eq!(record.is_resolved(), result.is_err());
        }
    }
}
