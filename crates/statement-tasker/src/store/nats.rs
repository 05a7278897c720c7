//! NATS JetStream K/V backend.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use super::{KvBackend, KvEntry};
use crate::error::TaskerError;

/// Key/value backend on a JetStream K/V bucket.
///
/// The bucket `max_age` is the record TTL, so entries are garbage collected
/// by the server.
pub struct NatsKv {
    store: kv::Store,
    /// Stream behind the bucket, used to list keys by subject filter.
    stream: jetstream::stream::Stream,
    bucket: String,
}

/// Subject filter selecting the keys of `bucket` that start with `prefix`.
///
/// Only a prefix ending on a token boundary narrows the filter; any other
/// prefix is matched against the listed keys afterwards.
fn subject_filter(bucket: &str, prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        format!("$KV.{}.{}>", bucket, prefix)
    } else {
        format!("$KV.{}.>", bucket)
    }
}

impl NatsKv {
    /// Open the bucket, creating it when missing.
    pub async fn open(client: async_nats::Client, bucket: &str, ttl: Duration) -> Result<Self, TaskerError> {
        let jetstream = jetstream::new(client);

        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => {
                tracing::info!(bucket = %bucket, "Connected to existing K/V bucket");
                store
            }
            Err(get_err) => {
                let store = jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        description: "Pending statement callbacks and singleton guards".to_string(),
                        history: 1,
                        max_age: ttl,
                        ..Default::default()
                    })
                    .await
                    .map_err(|create_err| {
                        TaskerError::Store(format!(
                            "K/V bucket {} unavailable (get: {}, create: {})",
                            bucket, get_err, create_err
                        ))
                    })?;
                tracing::info!(bucket = %bucket, ttl_secs = ttl.as_secs(), "Created K/V bucket");
                store
            }
        };

        let stream_name = format!("KV_{}", bucket);
        let stream = jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| TaskerError::Store(format!("K/V stream {} unavailable: {}", stream_name, e)))?;

        Ok(Self {
            store,
            stream,
            bucket: bucket.to_string(),
        })
    }

    fn store_error(&self, op: &str, key: &str, e: impl std::fmt::Display) -> TaskerError {
        TaskerError::Store(format!("{} {}/{} failed: {}", op, self.bucket, key, e))
    }
}

#[async_trait]
impl KvBackend for NatsKv {
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>, TaskerError> {
        match self.store.create(key, value.into()).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(self.store_error("create", key, e)),
        }
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, TaskerError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| self.store_error("read", key, e))?;

        Ok(entry
            .filter(|e| e.operation == kv::Operation::Put)
            .map(|e| KvEntry {
                value: e.value.to_vec(),
                revision: e.revision,
            }))
    }

    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<Option<u64>, TaskerError> {
        match self.store.update(key, value.into(), revision).await {
            Ok(next) => Ok(Some(next)),
            Err(e) => {
                // A revision mismatch and a transport failure share an error
                // kind; tell them apart by re-reading the entry.
                match self.entry(key).await? {
                    Some(current) if current.revision != revision => Ok(None),
                    None => Ok(None),
                    Some(_) => Err(self.store_error("update", key, e)),
                }
            }
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TaskerError> {
        let mut subjects = self
            .stream
            .info_with_subjects(subject_filter(&self.bucket, prefix))
            .await
            .map_err(|e| self.store_error("list", prefix, e))?;

        let key_start = format!("$KV.{}.", self.bucket);
        let mut matching = Vec::new();
        while let Some(subject) = subjects.next().await {
            let (subject, _) = subject.map_err(|e| self.store_error("list", prefix, e))?;
            match subject.strip_prefix(&key_start) {
                Some(key) if key.starts_with(prefix) => matching.push(key.to_string()),
                _ => {}
            }
        }

        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_filter() {
        assert_eq!(
            subject_filter("statement_tracking", "pending.ZXhlYy0x."),
            "$KV.statement_tracking.pending.ZXhlYy0x.>"
        );
        assert_eq!(subject_filter("statement_tracking", ""), "$KV.statement_tracking.>");
        assert_eq!(subject_filter("statement_tracking", "pend"), "$KV.statement_tracking.>");
    }
}
