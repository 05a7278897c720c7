//! Completion events passed from the listener to the completer.

use serde::{Deserialize, Serialize};
use statement_api::{StatementStatus, StatusChangeNotification};

use crate::identity::InvocationKey;

/// A statement reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub statement_id: String,
    pub status: StatementStatus,
    pub detail_type: String,

    /// Identity recovered from the statement name; `None` for untracked statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<InvocationKey>,

    /// Raw notification, forwarded as the task output or failure cause.
    pub notification: StatusChangeNotification,
}

impl CompletionEvent {
    /// Build an event from a notification.
    ///
    /// Returns `None` for notifications that are not terminal status changes.
    pub fn from_notification(notification: StatusChangeNotification) -> Option<Self> {
        if !notification.is_status_change() || !notification.detail.state.is_terminal() {
            return None;
        }

        let invocation = notification
            .detail
            .statement_name
            .as_deref()
            .and_then(InvocationKey::from_statement_name);

        Some(Self {
            statement_id: notification.detail.statement_id.clone(),
            status: notification.detail.state,
            detail_type: notification.detail_type.clone(),
            invocation,
            notification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_notification_becomes_event() {
        let key = InvocationKey::generate("exec-1");
        let notification =
            StatusChangeNotification::new("stmt-1", Some(&key.statement_name()), StatementStatus::Failed);

        let event = CompletionEvent::from_notification(notification).unwrap();
        assert_eq!(event.status, StatementStatus::Failed);
        assert_eq!(event.invocation, Some(key));
    }

    #[test]
    fn test_active_notification_is_skipped() {
        let notification = StatusChangeNotification::new("stmt-1", None, StatementStatus::Started);
        assert!(CompletionEvent::from_notification(notification).is_none());
    }

    #[test]
    fn test_other_detail_type_is_skipped() {
        let mut notification = StatusChangeNotification::new("stmt-1", None, StatementStatus::Finished);
        notification.detail_type = "Redshift Cluster State Change".to_string();
        assert!(CompletionEvent::from_notification(notification).is_none());
    }

    #[test]
    fn test_untracked_statement_has_no_invocation() {
        let notification =
            StatusChangeNotification::new("stmt-1", Some("nightly-vacuum"), StatementStatus::Finished);
        let event = CompletionEvent::from_notification(notification).unwrap();
        assert!(event.invocation.is_none());
    }
}
