//! In-memory key/value backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{KvBackend, KvEntry};
use crate::error::TaskerError;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, KvEntry>,
    last_revision: u64,
}

/// Key/value backend held in process memory.
#[derive(Default)]
pub struct MemoryKv {
    inner: RwLock<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>, TaskerError> {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(key) {
            return Ok(None);
        }

        inner.last_revision += 1;
        let revision = inner.last_revision;
        inner.entries.insert(key.to_string(), KvEntry { value, revision });
        Ok(Some(revision))
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, TaskerError> {
        Ok(self.inner.read().await.entries.get(key).cloned())
    }

    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<Option<u64>, TaskerError> {
        let mut inner = self.inner.write().await;
        match inner.entries.get(key) {
            Some(current) if current.revision == revision => {}
            _ => return Ok(None),
        }

        inner.last_revision += 1;
        let revision = inner.last_revision;
        inner.entries.insert(key.to_string(), KvEntry { value, revision });
        Ok(Some(revision))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TaskerError> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
