//! Engine configuration loaded from TOML.
//!
//! ```toml
//! [engine]
//! sweep_interval_secs = 30
//! max_conflict_retries = 3
//! tie_break = "declaration_order"
//!
//! [approvals]
//! ttl_secs = 86400
//!
//! [[branch_rules]]
//! pattern = "main"
//! environment = "staging"
//! lock_type = "soft_locked"
//! requires_approval = true
//! required_approvers = 1
//! required_roles = ["operator"]
//!
//! [permissions.staging]
//! developer = ["view", "deploy"]
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use gatekeeper_state::Role;
use serde::{Deserialize, Serialize};

use crate::branch_rules::{BranchRule, RuleOverlap, RuleSet, TieBreak};
use crate::domain::{GovernanceError, Result};
use crate::rbac::{PermissionMatrix, DEFAULT_ENVIRONMENT};

/// Environment variable binaries read the config path from.
pub const CONFIG_ENV: &str = "GATEKEEPER_CONFIG";

/// `[engine]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sweep_interval_secs: u64,
    /// Retries after the first attempt of a conditional write.
    pub max_conflict_retries: u32,
    pub tie_break: TieBreak,
    pub audit_page_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            max_conflict_retries: 3,
            tie_break: TieBreak::DeclarationOrder,
            audit_page_size: 100,
        }
    }
}

/// `[approvals]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Lifetime of a new approval request.
    pub ttl_secs: u64,
    /// Approvals needed when only a soft lock (not the rule) demands sign-off.
    pub soft_lock_required_approvals: u32,
    pub soft_lock_required_roles: BTreeSet<Role>,
    pub block_self_approval: bool,
    pub require_distinct_approvers: bool,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            soft_lock_required_approvals: 1,
            soft_lock_required_roles: BTreeSet::from([Role::Approver, Role::Admin]),
            block_self_approval: true,
            require_distinct_approvers: true,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub engine: EngineSettings,
    pub approvals: ApprovalSettings,
    pub branch_rules: Vec<BranchRule>,
    pub permissions: PermissionMatrix,
}

/// A non-fatal finding from [`GovernanceConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigWarning {
    RuleOverlap(RuleOverlap),
    /// A rule targets an environment nobody holds permissions on.
    EnvironmentWithoutPermissions { environment: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleOverlap(o) => write!(
                f,
                "branch rule #{} ({}) shadows #{} ({}) at equal specificity",
                o.winner, o.winner_pattern, o.shadowed, o.shadowed_pattern
            ),
            Self::EnvironmentWithoutPermissions { environment } => {
                write!(f, "environment {environment} has no permission row")
            }
        }
    }
}

impl GovernanceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| GovernanceError::InvalidConfig(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GovernanceError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration, returning warnings for suspicious but legal
    /// settings and `InvalidConfig` for anything unusable.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>> {
        if self.engine.sweep_interval_secs == 0 {
            return Err(invalid("engine.sweep_interval_secs must be positive"));
        }
        if self.engine.audit_page_size == 0 {
            return Err(invalid("engine.audit_page_size must be positive"));
        }
        if self.approvals.ttl_secs == 0 {
            return Err(invalid("approvals.ttl_secs must be positive"));
        }
        if self.approvals.soft_lock_required_approvals == 0 {
            return Err(invalid("approvals.soft_lock_required_approvals must be positive"));
        }

        let (_, overlaps) = RuleSet::compile(self.branch_rules.clone(), self.engine.tie_break)?;
        let mut warnings: Vec<ConfigWarning> =
            overlaps.into_iter().map(ConfigWarning::RuleOverlap).collect();

        let has_default_row = self.permissions.has_row(DEFAULT_ENVIRONMENT);
        let explicit: BTreeSet<&str> = self.permissions.environments().collect();
        let mut seen = BTreeSet::new();
        for rule in &self.branch_rules {
            let env = rule.environment.as_str();
            if !has_default_row && !explicit.contains(env) && seen.insert(env) {
                warnings.push(ConfigWarning::EnvironmentWithoutPermissions {
                    environment: env.to_string(),
                });
            }
        }
        Ok(warnings)
    }
}

fn invalid(msg: &str) -> GovernanceError {
    GovernanceError::InvalidConfig(msg.to_string())
}
