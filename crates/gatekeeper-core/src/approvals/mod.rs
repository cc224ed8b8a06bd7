//! Approval Workflow Engine.
//!
//! `Pending -> Notified -> Voting -> {Approved | Rejected | Expired}`.
//! Terminal statuses are reached once and never left.

pub mod engine;
pub mod notification;
pub mod workflow;

pub use engine::{ApprovalContext, ApprovalEngine};
pub use notification::{ChannelNotifier, LogNotifier, NotificationEvent, NotificationSink, NotifyError};
pub use workflow::{admit_vote, evaluate, is_expired_at, qualifying_approvals};
