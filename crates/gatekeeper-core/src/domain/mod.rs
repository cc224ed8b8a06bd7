//! Domain models for Gatekeeper.
//!
//! Canonical definitions shared by every component:
//! - `DeploymentRequest` / `GovernanceDecision`: the engine's external contract
//! - `ReasonCode`: stable codes carried by verdicts, errors and audit entries
//! - `GovernanceError`: the error taxonomy

pub mod decision;
pub mod error;
pub mod reason;

pub use decision::{DecisionStatus, DeploymentRequest, GovernanceDecision};
pub use error::{GovernanceError, Result};
pub use reason::ReasonCode;
