//! Invocation identity.
//!
//! An invocation is identified by the workflow execution it belongs to and a
//! per-invocation id. The pair is encoded into the statement name so that it
//! round-trips through the statement service and comes back on the
//! completion notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use crate::error::TaskerError;

/// Prefix of generated execution ids for invocations outside a workflow.
pub const ADHOC_EXECUTION_PREFIX: &str = "adhoc:";

const MAX_INVOCATION_AGE_SECS: i64 = 365 * 24 * 60 * 60;

/// Last generated invocation time in epoch microseconds.
static LAST_INVOCATION_MICROS: AtomicI64 = AtomicI64::new(0);

/// Composite key of a pending callback record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub execution_id: String,
    pub invocation_id: String,
}

impl InvocationKey {
    pub fn new(execution_id: impl Into<String>, invocation_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            invocation_id: invocation_id.into(),
        }
    }

    /// Key for a new invocation of `execution_id`, stamped with the current time.
    ///
    /// Generated ids are strictly increasing within the process.
    pub fn generate(execution_id: impl Into<String>) -> Self {
        Self::new(execution_id, next_invocation_id())
    }

    /// Name sent to the statement service.
    pub fn statement_name(&self) -> String {
        format!("{}:{}", self.execution_id, self.invocation_id)
    }

    /// Recover the key from a statement name.
    ///
    /// Returns `None` for statements not started by the tasker.
    pub fn from_statement_name(name: &str) -> Option<Self> {
        let (execution_id, invocation_id) = name.rsplit_once(':')?;
        if execution_id.is_empty() || !is_valid_invocation_id(invocation_id, Utc::now()) {
            return None;
        }
        Some(Self::new(execution_id, invocation_id))
    }

    /// Compare by invocation time; later invocations sort greater.
    pub fn cmp_invocation(&self, other: &Self) -> Ordering {
        parse_invocation_id(&self.invocation_id).cmp(&parse_invocation_id(&other.invocation_id))
    }
}

impl std::fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.execution_id, self.invocation_id)
    }
}

/// Execution id for an invocation that has no workflow execution.
pub fn adhoc_execution_id() -> String {
    format!("{}{}", ADHOC_EXECUTION_PREFIX, uuid::Uuid::new_v4())
}

/// Invocation id for an instant: epoch seconds with microsecond precision.
pub fn invocation_id_at(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

fn next_invocation_id() -> String {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_INVOCATION_MICROS
        .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    let micros = now.max(previous + 1);
    format!("{}.{:06}", micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
}

/// Parse an invocation id into `(seconds, microseconds)`.
fn parse_invocation_id(id: &str) -> Option<(i64, u32)> {
    let (secs, fraction) = id.split_once('.').unwrap_or((id, ""));
    if secs.is_empty() || fraction.len() > 6 {
        return None;
    }
    if !secs.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs = secs.parse::<i64>().ok()?;
    let micros = if fraction.is_empty() {
        0
    } else {
        format!("{:0<6}", fraction).parse::<u32>().ok()?
    };
    Some((secs, micros))
}

/// An invocation id is valid when it parses as a timestamp within a year of `now`.
pub fn is_valid_invocation_id(id: &str, now: DateTime<Utc>) -> bool {
    match parse_invocation_id(id) {
        Some((secs, _)) => (now.timestamp() - secs).abs() <= MAX_INVOCATION_AGE_SECS,
        None => false,
    }
}

/// Validate a caller-supplied invocation id.
pub fn validate_invocation_id(id: &str) -> Result<(), TaskerError> {
    if is_valid_invocation_id(id, Utc::now()) {
        Ok(())
    } else {
        Err(TaskerError::InvalidRequest(format!(
            "invocationId '{}' is not a recent epoch timestamp",
            id
        )))
    }
}
