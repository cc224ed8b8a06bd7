//! Gatekeeper Core Library
//!
//! Delivery governance decisions: branch → environment resolution,
//! environment locks, role-based authorization and multi-approver sign-off,
//! with every decision and transition recorded in an append-only audit log.

pub mod approvals;
pub mod audit;
pub mod branch_rules;
pub mod config;
pub mod domain;
pub mod locks;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod rbac;
pub mod sweep;
pub mod telemetry;

pub use approvals::{
    ApprovalContext, ApprovalEngine, ChannelNotifier, LogNotifier, NotificationEvent,
    NotificationSink, NotifyError,
};
pub use audit::{AuditQuery, AuditRecorder, SYSTEM_USER};
pub use branch_rules::{
    BranchResolution, BranchResolver, BranchRule, Matcher, RuleMatch, RuleOverlap, RuleSet,
    Specificity, TieBreak,
};
pub use config::{ApprovalSettings, ConfigWarning, EngineSettings, GovernanceConfig, CONFIG_ENV};
pub use domain::{
    DecisionStatus, DeploymentRequest, GovernanceDecision, GovernanceError, ReasonCode, Result,
};
pub use locks::{EffectiveLock, EmergencyUnlock, LockRegistry, LockSource};
pub use orchestrator::{GovernanceEngine, Stores};
pub use rbac::{Actor, AuthzDecision, Capability, PermissionMatrix};
pub use sweep::{SweepReport, Sweeper};

pub use gatekeeper_state::{
    ApprovalId, ApprovalRequest, ApprovalStatus, AuditEntry, AuditFilter, AuditResult,
    EnvironmentLock, LockType, ResourceType, Role, ScheduledWindow, Versioned, VoteDecision,
    WindowKind,
};

pub use metrics::METRICS;
pub use obs::{
    emit_approval_transition, emit_decision, emit_lock_changed, emit_sweep_completed,
    emit_vote_cast, DecisionSpan,
};
pub use telemetry::init_tracing;

/// Gatekeeper version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
