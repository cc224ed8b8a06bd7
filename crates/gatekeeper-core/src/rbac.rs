//! Role-based access control against a per-environment capability matrix.
//!
//! The matrix is the single source of truth: no role, `Admin` included, is
//! special-cased. An all-powerful admin is simply a row granting every
//! capability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use gatekeeper_state::Role;
use serde::{Deserialize, Serialize};

use crate::domain::ReasonCode;

/// Environment key whose row applies to environments without their own row.
pub const DEFAULT_ENVIRONMENT: &str = "*";

/// Named permission granted to a role for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Deploy,
    /// Manage locks: set, schedule, emergency unlock.
    Unlock,
    Approve,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::View,
        Capability::Deploy,
        Capability::Unlock,
        Capability::Approve,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Deploy => "deploy",
            Self::Unlock => "unlock",
            Self::Approve => "approve",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// The identity a mutating operation runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// Authorization decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthzDecision {
    Allowed,
    Denied {
        reason_code: ReasonCode,
        reason: String,
    },
}

impl AuthzDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

type RawMatrix = BTreeMap<String, BTreeMap<String, BTreeSet<Capability>>>;

/// Mapping `(environment, role) -> capabilities`.
///
/// An environment with an explicit row uses only that row; otherwise the
/// `"*"` row applies. Missing entries grant nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMatrix", into = "RawMatrix")]
pub struct PermissionMatrix {
    rows: BTreeMap<String, BTreeMap<Role, BTreeSet<Capability>>>,
}

// Role keys go through strings so TOML and JSON tables deserialize alike.
impl TryFrom<RawMatrix> for PermissionMatrix {
    type Error = String;

    fn try_from(raw: RawMatrix) -> Result<Self, Self::Error> {
        let mut rows = BTreeMap::new();
        for (environment, roles) in raw {
            let mut row = BTreeMap::new();
            for (role, caps) in roles {
                let role: Role = role.parse().map_err(|e| format!("{environment}: {e}"))?;
                row.insert(role, caps);
            }
            rows.insert(environment, row);
        }
        Ok(Self { rows })
    }
}

impl From<PermissionMatrix> for RawMatrix {
    fn from(matrix: PermissionMatrix) -> Self {
        matrix
            .rows
            .into_iter()
            .map(|(env, roles)| {
                let roles = roles
                    .into_iter()
                    .map(|(role, caps)| (role.as_str().to_string(), caps))
                    .collect();
                (env, roles)
            })
            .collect()
    }
}

impl PermissionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant capabilities to a role on an environment (builder pattern).
    pub fn grant(
        mut self,
        environment: impl Into<String>,
        role: Role,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.rows
            .entry(environment.into())
            .or_default()
            .entry(role)
            .or_default()
            .extend(capabilities);
        self
    }

    fn row(&self, environment: &str) -> Option<&BTreeMap<Role, BTreeSet<Capability>>> {
        self.rows
            .get(environment)
            .or_else(|| self.rows.get(DEFAULT_ENVIRONMENT))
    }

    /// Capabilities a role holds on an environment.
    pub fn capabilities(&self, role: Role, environment: &str) -> BTreeSet<Capability> {
        self.row(environment)
            .and_then(|r| r.get(&role))
            .cloned()
            .unwrap_or_default()
    }

    /// Check whether `role` holds `capability` on `environment`. Pure lookup.
    pub fn authorize(&self, role: Role, environment: &str, capability: Capability) -> AuthzDecision {
        if self.capabilities(role, environment).contains(&capability) {
            AuthzDecision::Allowed
        } else {
            AuthzDecision::Denied {
                reason_code: ReasonCode::RbacDenied,
                reason: format!("role {role} lacks {capability} on {environment}"),
            }
        }
    }

    /// Whether `environment` has its own row.
    pub fn has_row(&self, environment: &str) -> bool {
        self.rows.contains_key(environment)
    }

    /// Environments with an explicit row (excluding the default row).
    pub fn environments(&self) -> impl Iterator<Item = &str> {
        self.rows
            .keys()
            .map(String::as_str)
            .filter(|e| *e != DEFAULT_ENVIRONMENT)
    }
}
