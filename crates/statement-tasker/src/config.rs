//! Tasker configuration.

use serde::Deserialize;
use statement_api::StatementTarget;
use std::time::Duration;

use crate::error::TaskerError;
use crate::queue::RedeliveryPolicy;
use crate::retry::RetryPolicy;

/// Tasker configuration loaded from environment variables.
///
/// Environment variables are prefixed with `TASKER_`:
/// - `TASKER_NATS_URL`: NATS server URL (default: "nats://localhost:4222")
/// - `TASKER_STATEMENT_ENDPOINT`: Statement service endpoint
/// - `TASKER_CLUSTER_IDENTIFIER`, `TASKER_DATABASE`, `TASKER_DB_USER`: statement target
/// - `TASKER_TRACKING_BUCKET`: K/V bucket holding pending callback records
/// - `TASKER_RECORD_TTL_SECS`: Record time-to-live (default: one day)
/// - `TASKER_MAX_RECEIVE_COUNT`: Deliveries before a completion is dead-lettered (default: 3)
/// - `TASKER_RETRY_*`: Throttling retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct TaskerConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Statement service endpoint
    #[serde(default = "default_statement_endpoint")]
    pub statement_endpoint: String,

    /// Cluster statements run on
    #[serde(default = "default_cluster_identifier")]
    pub cluster_identifier: String,

    /// Database statements run in
    #[serde(default = "default_database")]
    pub database: String,

    /// Database user statements run as
    #[serde(default = "default_db_user")]
    pub db_user: String,

    /// K/V bucket for the tracking store
    #[serde(default = "default_tracking_bucket")]
    pub tracking_bucket: String,

    /// Pending callback record TTL in seconds
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// Subject carrying status change notifications
    #[serde(default = "default_notification_subject")]
    pub notification_subject: String,

    /// Stream capturing status change notifications
    #[serde(default = "default_notification_stream")]
    pub notification_stream: String,

    /// Durable consumer the listener reads notifications with
    #[serde(default = "default_listener_consumer")]
    pub listener_consumer: String,

    /// Work queue stream name
    #[serde(default = "default_work_stream")]
    pub work_stream: String,

    /// Work queue subject
    #[serde(default = "default_work_subject")]
    pub work_subject: String,

    /// Durable consumer name of the completer
    #[serde(default = "default_work_consumer")]
    pub work_consumer: String,

    /// Dead-letter stream name
    #[serde(default = "default_dead_letter_stream")]
    pub dead_letter_stream: String,

    /// Dead-letter subject
    #[serde(default = "default_dead_letter_subject")]
    pub dead_letter_subject: String,

    /// Deliveries before a completion is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Delay before a failed delivery is redelivered, in milliseconds
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Subject prefix for callback signals
    #[serde(default = "default_callback_subject_prefix")]
    pub callback_subject_prefix: String,

    /// Callback signal request timeout in milliseconds
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,

    /// First retry interval for throttled calls, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Backoff multiplier between throttled retries
    #[serde(default = "default_retry_backoff_rate")]
    pub retry_backoff_rate: f64,

    /// Retries after the first call
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Upper bound for issuing a statement, in seconds
    #[serde(default = "default_issue_timeout_secs")]
    pub issue_timeout_secs: u64,

    /// Heartbeat timeout for callback waits, in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Wait between describe calls when polling, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Completions handled concurrently
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_statement_endpoint() -> String {
    "http://localhost:4566".to_string()
}

fn default_cluster_identifier() -> String {
    "analytics".to_string()
}

fn default_database() -> String {
    "dev".to_string()
}

fn default_db_user() -> String {
    "awsuser".to_string()
}

fn default_tracking_bucket() -> String {
    "statement_tracking".to_string()
}

fn default_record_ttl_secs() -> u64 {
    86400
}

fn default_notification_subject() -> String {
    "statements.status".to_string()
}

fn default_notification_stream() -> String {
    "statement_notifications".to_string()
}

fn default_listener_consumer() -> String {
    "completion_listener".to_string()
}

fn default_work_stream() -> String {
    "statement_completions".to_string()
}

fn default_work_subject() -> String {
    "tasker.completions".to_string()
}

fn default_work_consumer() -> String {
    "completer".to_string()
}

fn default_dead_letter_stream() -> String {
    "statement_completions_dlq".to_string()
}

fn default_dead_letter_subject() -> String {
    "tasker.completions.dlq".to_string()
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_redelivery_delay_ms() -> u64 {
    1000
}

fn default_callback_subject_prefix() -> String {
    "tasker.callbacks".to_string()
}

fn default_callback_timeout_ms() -> u64 {
    5000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_retry_backoff_rate() -> f64 {
    1.5
}

fn default_retry_max_attempts() -> u32 {
    10
}

fn default_issue_timeout_secs() -> u64 {
    29
}

fn default_heartbeat_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    4
}

impl TaskerConfig {
    /// Load configuration from `TASKER_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, TaskerError> {
        let config = envy::prefixed("TASKER_").from_env::<TaskerConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot run with.
    pub fn validate(&self) -> Result<(), TaskerError> {
        if !self.retry_backoff_rate.is_finite() || self.retry_backoff_rate < 1.0 {
            return Err(TaskerError::Config(format!(
                "retry_backoff_rate must be a finite number of at least 1.0, got {}",
                self.retry_backoff_rate
            )));
        }
        if self.max_receive_count == 0 {
            return Err(TaskerError::Config("max_receive_count must be at least 1".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(TaskerError::Config("max_concurrent must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Where statements run.
    pub fn target(&self) -> StatementTarget {
        StatementTarget {
            cluster_identifier: self.cluster_identifier.clone(),
            database: self.database.clone(),
            db_user: self.db_user.clone(),
        }
    }

    /// Throttling retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry_interval_ms),
            backoff_rate: self.retry_backoff_rate,
            max_attempts: self.retry_max_attempts,
        }
    }

    /// Work queue redelivery policy.
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_receive_count: self.max_receive_count,
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
        }
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_secs(self.issue_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            statement_endpoint: default_statement_endpoint(),
            cluster_identifier: default_cluster_identifier(),
            database: default_database(),
            db_user: default_db_user(),
            tracking_bucket: default_tracking_bucket(),
            record_ttl_secs: default_record_ttl_secs(),
            notification_subject: default_notification_subject(),
            notification_stream: default_notification_stream(),
            listener_consumer: default_listener_consumer(),
            work_stream: default_work_stream(),
            work_subject: default_work_subject(),
            work_consumer: default_work_consumer(),
            dead_letter_stream: default_dead_letter_stream(),
            dead_letter_subject: default_dead_letter_subject(),
            max_receive_count: default_max_receive_count(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            callback_subject_prefix: default_callback_subject_prefix(),
            callback_timeout_ms: default_callback_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_backoff_rate: default_retry_backoff_rate(),
            retry_max_attempts: default_retry_max_attempts(),
            issue_timeout_secs: default_issue_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TaskerConfig::default();
        assert_eq!(config.tracking_bucket, "statement_tracking");
        assert_eq!(config.max_receive_count, 3);
        assert_eq!(config.notification_stream, "statement_notifications");
        assert_eq!(config.record_ttl(), Duration::from_secs(86400));
        assert_eq!(config.issue_timeout(), Duration::from_secs(29));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = TaskerConfig::default().retry_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_rate, 1.5);
        assert_eq!(policy.max_attempts, 10);
    }

    #[test]
    fn test_config_from_env_map() {
        let vars = vec![
            ("TASKER_DATABASE".to_string(), "warehouse".to_string()),
            ("TASKER_MAX_RECEIVE_COUNT".to_string(), "5".to_string()),
        ];
        let config: TaskerConfig = envy::prefixed("TASKER_").from_iter(vars).unwrap();

        assert_eq!(config.database, "warehouse");
        assert_eq!(config.redelivery_policy().max_receive_count, 5);
        assert_eq!(config.target().cluster_identifier, "analytics");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_backoff_rate_is_rejected() {
        for rate in ["-2", "NaN", "0.5", "inf"] {
            let vars = vec![("TASKER_RETRY_BACKOFF_RATE".to_string(), rate.to_string())];
            let config: TaskerConfig = envy::prefixed("TASKER_").from_iter(vars).unwrap();
            let err = config.validate().unwrap_err();
            assert!(matches!(err, TaskerError::Config(ref m) if m.contains("retry_backoff_rate")), "{}", rate);
        }
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config = TaskerConfig {
            max_concurrent: 0,
            ..TaskerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TaskerError::Config(_))));
    }
}
