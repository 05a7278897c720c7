//! Statement service data model.
//!
//! Field names follow the service's PascalCase JSON wire format.

use serde::{Deserialize, Serialize};

/// Suffix of the `detail-type` carried by status change notifications.
pub const STATUS_CHANGE_DETAIL_TYPE: &str = "Statement Status Change";

/// Lifecycle status of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementStatus {
    /// Accepted by the service, not yet scheduled.
    Submitted,
    /// Scheduled on the cluster.
    Picked,
    /// Running.
    Started,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Cancelled before completion.
    Aborted,
}

impl StatementStatus {
    /// Statement has not reached a terminal state yet.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Picked | Self::Started)
    }

    /// Statement has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Picked => "PICKED",
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for StatementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster, database and user a statement runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatementTarget {
    pub cluster_identifier: String,
    pub database: String,
    pub db_user: String,
}

/// Request to issue a statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteStatementRequest {
    /// SQL text.
    pub sql: String,

    /// Name that round-trips into status change notifications.
    pub statement_name: String,

    /// Emit a status change notification when the statement completes.
    pub with_event: bool,

    /// Where to run the statement.
    #[serde(flatten)]
    pub target: StatementTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ExecuteStatementResponse {
    pub id: String,
}

/// Current state of a statement as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatementDescription {
    pub id: String,

    pub status: StatementStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_result_set: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_rows: Option<i64>,

    /// Remaining service fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One page of a statement's result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatementResult {
    #[serde(default)]
    pub records: Vec<Vec<serde_json::Value>>,

    #[serde(default)]
    pub column_metadata: Vec<serde_json::Value>,

    #[serde(default)]
    pub total_num_rows: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CancelStatementResponse {
    pub status: bool,
}

/// Event bus notification emitted when a statement changes status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeNotification {
    #[serde(rename = "detail-type")]
    pub detail_type: String,

    #[serde(default)]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<chrono::DateTime<chrono::Utc>>,

    pub detail: StatusChangeDetail,
}

/// Payload of a [`StatusChangeNotification`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeDetail {
    pub statement_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_name: Option<String>,

    pub state: StatementStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

impl StatusChangeNotification {
    /// Build a notification for a statement reaching `state`.
    pub fn new(statement_id: &str, statement_name: Option<&str>, state: StatementStatus) -> Self {
        Self {
            detail_type: format!("Redshift Data {}", STATUS_CHANGE_DETAIL_TYPE),
            source: "aws.redshift-data".to_string(),
            time: Some(chrono::Utc::now()),
            detail: StatusChangeDetail {
                statement_id: statement_id.to_string(),
                statement_name: statement_name.map(str::to_string),
                state,
                rows: None,
                principal: None,
            },
        }
    }

    /// Whether this is a status change notification at all.
    pub fn is_status_change(&self) -> bool {
        self.detail_type.ends_with(STATUS_CHANGE_DETAIL_TYPE)
    }
}
