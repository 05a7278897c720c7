//! Callback signals over NATS request/reply.
//!
//! The waiting side subscribes to `{prefix}.>` and delivers into its local
//! [`CallbackHub`]; the signalling side sends a request to
//! `{prefix}.{token}` and reads `ok` or `expired` from the reply.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CallbackHub, CallbackSignal, SignalError, TaskOutcome};
use crate::error::TaskerError;

const REPLY_OK: &str = "ok";
const REPLY_EXPIRED: &str = "expired";

#[derive(Debug, Serialize, Deserialize)]
struct SignalMessage {
    token: String,
    outcome: TaskOutcome,
}

/// Sends callback signals to the process holding the token.
#[derive(Clone)]
pub struct NatsCallbackSignal {
    client: async_nats::Client,
    subject_prefix: String,
    timeout: Duration,
}

impl NatsCallbackSignal {
    pub fn new(client: async_nats::Client, subject_prefix: &str, timeout: Duration) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.to_string(),
            timeout,
        }
    }

    fn subject(&self, token: &str) -> String {
        format!("{}.{}", self.subject_prefix, token)
    }
}

#[async_trait]
impl CallbackSignal for NatsCallbackSignal {
    async fn signal(&self, token: &str, outcome: TaskOutcome) -> Result<(), SignalError> {
        let message = SignalMessage {
            token: token.to_string(),
            outcome,
        };
        let payload = serde_json::to_vec(&message).map_err(|e| SignalError::Transport(e.to_string()))?;

        let reply = tokio::time::timeout(self.timeout, self.client.request(self.subject(token), payload.into()))
            .await
            .map_err(|_| SignalError::Transport(format!("no reply for {} within {:?}", token, self.timeout)))?
            .map_err(|e| match e.kind() {
                // Nobody is waiting on this token any more.
                async_nats::client::RequestErrorKind::NoResponders => SignalError::Expired(token.to_string()),
                _ => SignalError::Transport(e.to_string()),
            })?;

        match std::str::from_utf8(&reply.payload) {
            Ok(REPLY_OK) => Ok(()),
            Ok(REPLY_EXPIRED) => Err(SignalError::Expired(token.to_string())),
            other => Err(SignalError::Transport(format!("unexpected reply: {:?}", other))),
        }
    }
}

/// Subscribe to callback signals and deliver them into `hub`.
pub async fn spawn_callback_listener(
    client: async_nats::Client,
    subject_prefix: &str,
    hub: CallbackHub,
) -> Result<tokio::task::JoinHandle<()>, TaskerError> {
    let subject = format!("{}.>", subject_prefix);
    let mut subscriber = client
        .subscribe(subject.clone())
        .await
        .map_err(|e| TaskerError::Nats(e.to_string()))?;

    tracing::info!(subject = %subject, "Subscribed to callback signals");

    Ok(tokio::spawn(async move {
        while let Some(msg) = subscriber.next().await {
            let reply = match serde_json::from_slice::<SignalMessage>(&msg.payload) {
                Ok(message) => match hub.resolve(&message.token, message.outcome).await {
                    Ok(()) => REPLY_OK,
                    Err(_) => REPLY_EXPIRED,
                },
                Err(e) => {
                    tracing::warn!(subject = %msg.subject, error = %e, "Failed to parse callback signal");
                    continue;
                }
            };

            if let Some(reply_to) = msg.reply {
                if let Err(e) = client.publish(reply_to, reply.into()).await {
                    tracing::warn!(error = %e, "Failed to reply to callback signal");
                }
            }
        }
        tracing::warn!("Callback signal subscription ended");
    }))
}
