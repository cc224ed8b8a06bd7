//! Outbound notifications about approval requests.
//!
//! The engine only publishes events; delivering them to people (mail, chat)
//! is the job of whatever consumes the sink.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeeper_state::{ApprovalId, ApprovalRequest, Role};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Reviewers of a new approval request should be informed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub request_id: ApprovalId,
    pub environment: String,
    pub commit_sha: String,
    pub requested_by: String,
    pub required_approvals: u32,
    pub required_roles: BTreeSet<Role>,
    pub expires_at: DateTime<Utc>,
}

impl From<&ApprovalRequest> for NotificationEvent {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.id,
            environment: request.environment.clone(),
            commit_sha: request.commit_sha.clone(),
            requested_by: request.requested_by.clone(),
            required_approvals: request.required_approvals,
            required_roles: request.required_roles.clone(),
            expires_at: request.expires_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Destination for approval notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: NotificationEvent) -> Result<(), NotifyError>;
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn publish(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        self.tx.send(event).map_err(|_| NotifyError::Closed)
    }
}

/// Writes events to the tracing log and drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn publish(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        tracing::info!(
            event = "approval.notification",
            request_id = %event.request_id,
            environment = %event.environment,
            commit_sha = %event.commit_sha,
            required_approvals = event.required_approvals,
            expires_at = %event.expires_at,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            request_id: ApprovalId::new(),
            environment: "staging".to_string(),
            commit_sha: "abc".to_string(),
            requested_by: "dev".to_string(),
            required_approvals: 1,
            required_roles: BTreeSet::new(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let sent = event();
        notifier.publish(sent.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_channel_notifier_reports_closed() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        assert!(matches!(
            notifier.publish(event()).await,
            Err(NotifyError::Closed)
        ));
    }
}
