//! Tracking store for pending callback records.
//!
//! Records and singleton guards live in a key/value backend that supports
//! conditional create and revision-checked updates. All invariants (one
//! unresolved record per key, one resolution per record, one live singleton
//! holder) are enforced with those two primitives.

mod memory;
mod nats;

pub use memory::MemoryKv;
pub use nats::NatsKv;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statement_api::StatementStatus;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskerError;
use crate::identity::InvocationKey;

const RECORD_PREFIX: &str = "pending";
const SINGLETON_PREFIX: &str = "singleton";

/// Attempts for a compare-and-swap loop before giving up.
const CAS_ATTEMPTS: usize = 8;

/// Raw entry in the key/value backend.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Key/value backend with optimistic concurrency.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Create `key` if absent. Returns `None` when the key already exists.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>, TaskerError>;

    /// Current entry of `key`.
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, TaskerError>;

    /// Replace `key` if it is still at `revision`. Returns `None` on a revision mismatch.
    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<Option<u64>, TaskerError>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TaskerError>;
}

/// How a pending callback was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_at: DateTime<Utc>,
    pub status: StatementStatus,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Pending callback record, one per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallbackRecord {
    pub execution_id: String,
    pub invocation_id: String,

    /// Absent for fire-and-forget invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,

    pub sql: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<String>,

    /// Set when started in singleton mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl PendingCallbackRecord {
    pub fn new(key: &InvocationKey, sql: &str, callback_token: Option<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            execution_id: key.execution_id.clone(),
            invocation_id: key.invocation_id.clone(),
            callback_token,
            sql: sql.to_string(),
            statement_id: None,
            singleton_key: None,
            created_at: now,
            expires_at: expiry(now, ttl),
            resolution: None,
        }
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(&self.execution_id, &self.invocation_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Value stored under a singleton key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonGuard {
    pub singleton_key: String,
    pub holder: InvocationKey,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub released: bool,
}

/// Result of trying to take a singleton guard.
#[derive(Debug, Clone, PartialEq)]
pub enum SingletonAcquire {
    Acquired,
    /// Another in-flight invocation holds the guard.
    Held(InvocationKey),
}

/// Result of claiming the resolution of a record.
#[derive(Debug, Clone)]
pub enum ResolutionClaim {
    /// Record missing or expired.
    NotFound,
    /// Record was resolved before.
    AlreadyResolved,
    /// Record tracks a different statement than the one completing.
    OtherStatement(String),
    /// Resolution written; `revision` is the revision holding it.
    Claimed {
        record: PendingCallbackRecord,
        revision: u64,
    },
}

/// Record together with the backend revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

fn expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    from + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}

fn encode(part: &str) -> String {
    URL_SAFE_NO_PAD.encode(part.as_bytes())
}

/// Backend key of the record for `key`.
pub fn record_key(key: &InvocationKey) -> String {
    format!(
        "{}.{}.{}",
        RECORD_PREFIX,
        encode(&key.execution_id),
        encode(&key.invocation_id)
    )
}

fn execution_prefix(execution_id: &str) -> String {
    format!("{}.{}.", RECORD_PREFIX, encode(execution_id))
}

/// Backend key of the guard for `singleton_key`.
pub fn singleton_guard_key(singleton_key: &str) -> String {
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, singleton_key.as_bytes());
    format!("{}.{}", SINGLETON_PREFIX, id)
}

/// Tracking store over a key/value backend.
#[derive(Clone)]
pub struct TrackingStore {
    backend: Arc<dyn KvBackend>,
    record_ttl: Duration,
}

impl TrackingStore {
    pub fn new(backend: Arc<dyn KvBackend>, record_ttl: Duration) -> Self {
        Self { backend, record_ttl }
    }

    /// Store backed by process memory.
    pub fn in_memory(record_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryKv::new()), record_ttl)
    }

    pub fn record_ttl(&self) -> Duration {
        self.record_ttl
    }

    fn decode<T: for<'de> Deserialize<'de>>(key: &str, entry: &KvEntry) -> Result<T, TaskerError> {
        serde_json::from_slice(&entry.value)
            .map_err(|e| TaskerError::Store(format!("Corrupt entry {}: {}", key, e)))
    }

    /// Create a record.
    ///
    /// Fails with `Conflict` while an unresolved, unexpired record exists for
    /// the same key. Resolved or expired records are replaced.
    pub async fn create_record(&self, record: &PendingCallbackRecord) -> Result<u64, TaskerError> {
        let key = record_key(&record.key());
        let data = serde_json::to_vec(record)?;

        for _ in 0..CAS_ATTEMPTS {
            if let Some(revision) = self.backend.create(&key, data.clone()).await? {
                tracing::debug!(
                    execution_id = %record.execution_id,
                    invocation_id = %record.invocation_id,
                    "Pending callback record created"
                );
                return Ok(revision);
            }

            let Some(entry) = self.backend.entry(&key).await? else {
                continue;
            };
            let existing: PendingCallbackRecord = Self::decode(&key, &entry)?;
            if !existing.is_resolved() && !existing.is_expired(Utc::now()) {
                return Err(TaskerError::Conflict(format!(
                    "invocation {} already has a pending callback",
                    record.key()
                )));
            }

            if let Some(revision) = self.backend.update(&key, data.clone(), entry.revision).await? {
                tracing::debug!(
                    execution_id = %record.execution_id,
                    invocation_id = %record.invocation_id,
                    "Pending callback record replaced"
                );
                return Ok(revision);
            }
        }

        Err(TaskerError::Conflict(format!(
            "invocation {} is being written concurrently",
            record.key()
        )))
    }

    /// Read a record. Expired records are invisible.
    pub async fn get(&self, key: &InvocationKey) -> Result<Option<Versioned<PendingCallbackRecord>>, TaskerError> {
        let backend_key = record_key(key);
        let Some(entry) = self.backend.entry(&backend_key).await? else {
            return Ok(None);
        };

        let record: PendingCallbackRecord = Self::decode(&backend_key, &entry)?;
        if record.is_expired(Utc::now()) {
            return Ok(None);
        }

        Ok(Some(Versioned {
            value: record,
            revision: entry.revision,
        }))
    }

    /// Compare-and-swap a record. Returns `None` when `revision` is stale.
    pub async fn update(&self, record: &PendingCallbackRecord, revision: u64) -> Result<Option<u64>, TaskerError> {
        let data = serde_json::to_vec(record)?;
        self.backend.update(&record_key(&record.key()), data, revision).await
    }

    /// Attach the service-assigned statement id to a record.
    pub async fn attach_statement_id(&self, key: &InvocationKey, statement_id: &str) -> Result<(), TaskerError> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.get(key).await? else {
                return Err(TaskerError::NotFound(format!("no pending callback for {}", key)));
            };

            let mut record = current.value;
            record.statement_id = Some(statement_id.to_string());
            if self.update(&record, current.revision).await?.is_some() {
                tracing::debug!(invocation = %key, statement_id, "Statement attached to record");
                return Ok(());
            }
        }

        Err(TaskerError::Store(format!("could not attach statement to {}", key)))
    }

    /// Mark a record resolved, at most once.
    ///
    /// The record TTL is refreshed so the resolved record stays readable.
    pub async fn claim_resolution(
        &self,
        key: &InvocationKey,
        statement_id: Option<&str>,
        status: StatementStatus,
        detail: serde_json::Value,
    ) -> Result<ResolutionClaim, TaskerError> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.get(key).await? else {
                return Ok(ResolutionClaim::NotFound);
            };

            let mut record = current.value;
            if record.is_resolved() {
                return Ok(ResolutionClaim::AlreadyResolved);
            }
            if let (Some(tracked), Some(completed)) = (record.statement_id.as_deref(), statement_id) {
                if tracked != completed {
                    return Ok(ResolutionClaim::OtherStatement(tracked.to_string()));
                }
            }

            let now = Utc::now();
            record.resolution = Some(Resolution {
                resolved_at: now,
                status,
                detail: detail.clone(),
            });
            record.expires_at = expiry(now, self.record_ttl);

            if let Some(revision) = self.update(&record, current.revision).await? {
                return Ok(ResolutionClaim::Claimed { record, revision });
            }
        }

        // Every attempt lost a race against another writer resolving the record.
        Ok(ResolutionClaim::AlreadyResolved)
    }

    /// Undo a claim made at `revision`, so a redelivered completion can claim again.
    pub async fn revert_resolution(&self, key: &InvocationKey, revision: u64) -> Result<bool, TaskerError> {
        let Some(current) = self.get(key).await? else {
            return Ok(false);
        };
        if current.revision != revision {
            return Ok(false);
        }

        let mut record = current.value;
        record.resolution = None;
        Ok(self.update(&record, revision).await?.is_some())
    }

    /// Latest visible record of an execution, by invocation time.
    pub async fn latest_record(&self, execution_id: &str) -> Result<Option<PendingCallbackRecord>, TaskerError> {
        let keys = self.backend.keys(&execution_prefix(execution_id)).await?;
        let now = Utc::now();
        let mut latest: Option<PendingCallbackRecord> = None;

        for key in keys {
            let Some(entry) = self.backend.entry(&key).await? else {
                continue;
            };
            let record: PendingCallbackRecord = match Self::decode(&key, &entry) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            if record.is_expired(now) || record.execution_id != execution_id {
                continue;
            }

            let newer = match &latest {
                Some(current) => record.key().cmp_invocation(&current.key()).is_gt(),
                None => true,
            };
            if newer {
                latest = Some(record);
            }
        }

        Ok(latest)
    }

    /// Take the singleton guard for `singleton_key` on behalf of `holder`.
    ///
    /// A guard whose holder record is resolved, missing or expired is stale
    /// and taken over.
    pub async fn acquire_singleton(
        &self,
        singleton_key: &str,
        holder: &InvocationKey,
    ) -> Result<SingletonAcquire, TaskerError> {
        let key = singleton_guard_key(singleton_key);
        let now = Utc::now();
        let guard = SingletonGuard {
            singleton_key: singleton_key.to_string(),
            holder: holder.clone(),
            acquired_at: now,
            expires_at: expiry(now, self.record_ttl),
            released: false,
        };
        let data = serde_json::to_vec(&guard)?;

        for _ in 0..CAS_ATTEMPTS {
            if self.backend.create(&key, data.clone()).await?.is_some() {
                tracing::debug!(singleton_key, holder = %holder, "Singleton guard acquired");
                return Ok(SingletonAcquire::Acquired);
            }

            let Some(entry) = self.backend.entry(&key).await? else {
                continue;
            };
            let existing: SingletonGuard = Self::decode(&key, &entry)?;
            if !self.is_stale(&existing).await? {
                return Ok(SingletonAcquire::Held(existing.holder));
            }

            if self.backend.update(&key, data.clone(), entry.revision).await?.is_some() {
                tracing::debug!(
                    singleton_key,
                    holder = %holder,
                    previous = %existing.holder,
                    "Stale singleton guard taken over"
                );
                return Ok(SingletonAcquire::Acquired);
            }
        }

        Err(TaskerError::ConcurrentExecution(format!(
            "singleton guard for '{}' is contended",
            singleton_key
        )))
    }

    async fn is_stale(&self, guard: &SingletonGuard) -> Result<bool, TaskerError> {
        if guard.released || Utc::now() >= guard.expires_at {
            return Ok(true);
        }

        Ok(match self.get(&guard.holder).await? {
            Some(holder) => holder.value.is_resolved(),
            None => true,
        })
    }

    /// Release the singleton guard if `holder` still holds it.
    pub async fn release_singleton(&self, singleton_key: &str, holder: &InvocationKey) -> Result<(), TaskerError> {
        let key = singleton_guard_key(singleton_key);

        for _ in 0..CAS_ATTEMPTS {
            let Some(entry) = self.backend.entry(&key).await? else {
                return Ok(());
            };
            let mut guard: SingletonGuard = Self::decode(&key, &entry)?;
            if guard.released || &guard.holder != holder {
                return Ok(());
            }

            guard.released = true;
            let data = serde_json::to_vec(&guard)?;
            if self.backend.update(&key, data, entry.revision).await?.is_some() {
                tracing::debug!(singleton_key, holder = %holder, "Singleton guard released");
                return Ok(());
            }
        }

        Err(TaskerError::Store(format!(
            "could not release singleton guard for '{}'",
            singleton_key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TrackingStore {
        TrackingStore::in_memory(Duration::from_secs(3600))
    }

    fn record(key: &InvocationKey) -> PendingCallbackRecord {
        PendingCallbackRecord::new(key, "select 1", Some("token-1".to_string()), Duration::from_secs(3600))
    }

    #[test]
    fn test_record_keys_are_valid_subject_tokens() {
        let key = InvocationKey::new("arn:aws:states:us-east-1:1:execution:sm:run/1", "1700000000.000001");
        let backend_key = record_key(&key);

        assert!(backend_key.starts_with("pending."));
        assert_eq!(backend_key.split('.').count(), 3);
        assert!(backend_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
    }

    #[test]
    fn test_singleton_guard_key_is_stable() {
        assert_eq!(singleton_guard_key("select 1"), singleton_guard_key("select 1"));
        assert_ne!(singleton_guard_key("select 1"), singleton_guard_key("select 2"));
    }

    #[tokio::test]
    async fn test_create_conflicts_while_unresolved() {
        let store = store();
        let key = InvocationKey::generate("exec-1");

        store.create_record(&record(&key)).await.unwrap();
        let err = store.create_record(&record(&key)).await.unwrap_err();
        assert!(matches!(err, TaskerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_resolved_record_can_be_replaced() {
        let store = store();
        let key = InvocationKey::generate("exec-1");
        store.create_record(&record(&key)).await.unwrap();

        let claim = store
            .claim_resolution(&key, None, StatementStatus::Finished, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(matches!(claim, ResolutionClaim::Claimed { .. }));

        store.create_record(&record(&key)).await.unwrap();
        let current = store.get(&key).await.unwrap().unwrap();
        assert!(!current.value.is_resolved());
    }

    #[tokio::test]
    async fn test_expired_record_is_invisible_and_replaceable() {
        let store = store();
        let key = InvocationKey::generate("exec-1");
        let expired = PendingCallbackRecord::new(&key, "select 1", None, Duration::ZERO);

        store.create_record(&expired).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());

        store.create_record(&record(&key)).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolution_is_claimed_once() {
        let store = store();
        let key = InvocationKey::generate("exec-1");
        store.create_record(&record(&key)).await.unwrap();
        store.attach_statement_id(&key, "stmt-1").await.unwrap();

        let first = store
            .claim_resolution(&key, Some("stmt-1"), StatementStatus::Finished, serde_json::Value::Null)
            .await
            .unwrap();
        let ResolutionClaim::Claimed { record, .. } = first else {
            panic!("expected claim");
        };
        assert_eq!(record.resolution.unwrap().status, StatementStatus::Finished);

        let second = store
            .claim_resolution(&key, Some("stmt-1"), StatementStatus::Finished, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(matches!(second, ResolutionClaim::AlreadyResolved));
    }

    #[tokio::test]
    async fn test_claim_for_other_statement() {
        let store = store();
        let key = InvocationKey::generate("exec-1");
        store.create_record(&record(&key)).await.unwrap();
        store.attach_statement_id(&key, "stmt-1").await.unwrap();

        let claim = store
            .claim_resolution(&key, Some("stmt-2"), StatementStatus::Finished, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(matches!(claim, ResolutionClaim::OtherStatement(ref id) if id == "stmt-1"));
    }

    #[tokio::test]
    async fn test_revert_resolution() {
        let store = store();
        let key = InvocationKey::generate("exec-1");
        store.create_record(&record(&key)).await.unwrap();

        let ResolutionClaim::Claimed { revision, .. } = store
            .claim_resolution(&key, None, StatementStatus::Failed, serde_json::Value::Null)
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };

        assert!(store.revert_resolution(&key, revision).await.unwrap());
        assert!(!store.get(&key).await.unwrap().unwrap().value.is_resolved());
    }

    #[tokio::test]
    async fn test_latest_record_by_invocation_time() {
        let store = store();
        let older = InvocationKey::new("exec-1", "1700000000.9");
        let newer = InvocationKey::new("exec-1", "1700000000.950000");
        let other = InvocationKey::new("exec-2", "1700000100.000000");

        for key in [&newer, &older, &other] {
            store.create_record(&record(key)).await.unwrap();
        }

        let latest = store.latest_record("exec-1").await.unwrap().unwrap();
        assert_eq!(latest.key(), newer);
        assert!(store.latest_record("exec-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_singleton_held_then_taken_over() {
        let store = store();
        let first = InvocationKey::new("exec-1", "1700000000.000001");
        let second = InvocationKey::new("exec-2", "1700000000.000002");
        store.create_record(&record(&first)).await.unwrap();

        assert_eq!(
            store.acquire_singleton("select 1", &first).await.unwrap(),
            SingletonAcquire::Acquired
        );
        assert_eq!(
            store.acquire_singleton("select 1", &second).await.unwrap(),
            SingletonAcquire::Held(first.clone())
        );

        // Holder resolved without releasing: guard is stale.
        store
            .claim_resolution(&first, None, StatementStatus::Finished, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(
            store.acquire_singleton("select 1", &second).await.unwrap(),
            SingletonAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_singleton_release() {
        let store = store();
        let first = InvocationKey::new("exec-1", "1700000000.000001");
        let second = InvocationKey::new("exec-2", "1700000000.000002");
        store.create_record(&record(&first)).await.unwrap();
        store.acquire_singleton("nightly", &first).await.unwrap();

        // Only the holder can release.
        store.release_singleton("nightly", &second).await.unwrap();
        assert!(matches!(
            store.acquire_singleton("nightly", &second).await.unwrap(),
            SingletonAcquire::Held(_)
        ));

        store.release_singleton("nightly", &first).await.unwrap();
        assert_eq!(
            store.acquire_singleton("nightly", &second).await.unwrap(),
            SingletonAcquire::Acquired
        );
    }
}
