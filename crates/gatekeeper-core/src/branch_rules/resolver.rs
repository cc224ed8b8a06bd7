//! Branch → environment resolution over an immutable rule snapshot.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use gatekeeper_state::{LockType, Role};
use serde::{Deserialize, Serialize};

use super::matcher::{compile, Matcher, Specificity};
use crate::domain::{GovernanceError, Result};

fn default_lock_type() -> LockType {
    LockType::Unlocked
}

/// Configuration mapping a branch pattern to an environment and its default
/// governance requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRule {
    pub pattern: String,
    pub environment: String,
    /// Lock type applied when the environment is first seen.
    #[serde(default = "default_lock_type")]
    pub lock_type: LockType,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub required_approvers: u32,
    #[serde(default)]
    pub required_roles: BTreeSet<Role>,
    /// Only applies to tagged refs.
    #[serde(default)]
    pub tagged_only: bool,
}

impl BranchRule {
    pub fn new(pattern: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            environment: environment.into(),
            lock_type: LockType::Unlocked,
            requires_approval: false,
            required_approvers: 0,
            required_roles: BTreeSet::new(),
            tagged_only: false,
        }
    }

    pub fn with_lock_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = lock_type;
        self
    }

    pub fn with_approval(mut self, approvers: u32, roles: impl IntoIterator<Item = Role>) -> Self {
        self.requires_approval = true;
        self.required_approvers = approvers;
        self.required_roles = roles.into_iter().collect();
        self
    }

    pub fn tagged_only(mut self) -> Self {
        self.tagged_only = true;
        self
    }
}

/// How rules of equal specificity are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The rule declared first wins.
    #[default]
    DeclarationOrder,
    /// Equal-specificity rules that may overlap are a configuration error.
    Strict,
}

/// Two rules that may match the same branch at the same specificity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOverlap {
    /// Declaration index of the rule that wins under `DeclarationOrder`.
    pub winner: usize,
    pub shadowed: usize,
    pub winner_pattern: String,
    pub shadowed_pattern: String,
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub environment: String,
    pub rule: BranchRule,
    /// Declaration index of the matched rule.
    pub rule_index: usize,
    pub specificity: Specificity,
}

/// Outcome of resolving a branch. `NoMatch` is a regular result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchResolution {
    Matched(RuleMatch),
    NoMatch,
}

impl BranchResolution {
    pub fn environment(&self) -> Option<&str> {
        match self {
            Self::Matched(m) => Some(&m.environment),
            Self::NoMatch => None,
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    index: usize,
    rule: BranchRule,
    matcher: Box<dyn Matcher>,
}

/// An immutable, validated set of compiled rules.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    tie_break: TieBreak,
}

impl RuleSet {
    /// Compile and validate rules.
    ///
    /// Returns potential overlaps as warnings under `DeclarationOrder` and as
    /// an error under `Strict`.
    pub fn compile(rules: Vec<BranchRule>, tie_break: TieBreak) -> Result<(Self, Vec<RuleOverlap>)> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            if rule.environment.trim().is_empty() {
                return Err(GovernanceError::InvalidConfig(format!(
                    "branch rule #{index} ({}) has no environment",
                    rule.pattern
                )));
            }
            if rule.requires_approval && rule.required_approvers == 0 {
                return Err(GovernanceError::InvalidConfig(format!(
                    "branch rule #{index} ({}) requires approval but required_approvers is 0",
                    rule.pattern
                )));
            }
            let matcher = compile(&rule.pattern).map_err(|e| {
                GovernanceError::InvalidConfig(format!("branch rule #{index}: {e}"))
            })?;
            compiled.push(CompiledRule {
                index,
                rule,
                matcher,
            });
        }

        let set = Self {
            rules: compiled,
            tie_break,
        };
        let overlaps = set.overlaps();
        if tie_break == TieBreak::Strict {
            if let Some(o) = overlaps.first() {
                return Err(GovernanceError::InvalidConfig(format!(
                    "branch rules #{} ({}) and #{} ({}) may overlap at equal specificity",
                    o.winner, o.winner_pattern, o.shadowed, o.shadowed_pattern
                )));
            }
        }
        Ok((set, overlaps))
    }

    /// An empty rule set; every branch resolves to `NoMatch`.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            tie_break: TieBreak::DeclarationOrder,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    // Conservative: equal specificity, same tag scope and same literal prefix
    // is reported even when the wildcard tails cannot actually collide.
    fn overlaps(&self) -> Vec<RuleOverlap> {
        let mut found = Vec::new();
        for (i, a) in self.rules.iter().enumerate() {
            for b in &self.rules[i + 1..] {
                if a.rule.tagged_only == b.rule.tagged_only
                    && a.matcher.specificity() == b.matcher.specificity()
                    && a.matcher.literal_prefix() == b.matcher.literal_prefix()
                {
                    found.push(RuleOverlap {
                        winner: a.index,
                        shadowed: b.index,
                        winner_pattern: a.rule.pattern.clone(),
                        shadowed_pattern: b.rule.pattern.clone(),
                    });
                }
            }
        }
        found
    }

    /// Resolve an untagged branch.
    pub fn resolve(&self, branch: &str) -> BranchResolution {
        self.resolve_ref(branch, false)
    }

    /// Resolve a branch, optionally as a tagged ref.
    ///
    /// Candidates rank by specificity, then tagged-only rules ahead of
    /// general ones (tagged refs only), then declaration order.
    pub fn resolve_ref(&self, branch: &str, tagged: bool) -> BranchResolution {
        self.rules
            .iter()
            .filter(|c| tagged || !c.rule.tagged_only)
            .filter(|c| c.matcher.matches(branch))
            .min_by(|a, b| {
                let ka = (a.matcher.specificity(), a.rule.tagged_only);
                let kb = (b.matcher.specificity(), b.rule.tagged_only);
                kb.cmp(&ka).then(a.index.cmp(&b.index))
            })
            .map_or(BranchResolution::NoMatch, |c| {
                BranchResolution::Matched(RuleMatch {
                    environment: c.rule.environment.clone(),
                    rule: c.rule.clone(),
                    rule_index: c.index,
                    specificity: c.matcher.specificity(),
                })
            })
    }
}

/// Holds the current rule snapshot. Matching reads an `Arc` snapshot; an
/// administrator replaces it wholesale, never mutating it in place.
#[derive(Debug)]
pub struct BranchResolver {
    current: RwLock<Arc<RuleSet>>,
}

impl BranchResolver {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// Compile rules and build a resolver, returning overlap warnings.
    pub fn from_rules(rules: Vec<BranchRule>, tie_break: TieBreak) -> Result<(Self, Vec<RuleOverlap>)> {
        let (set, overlaps) = RuleSet::compile(rules, tie_break)?;
        Ok((Self::new(set), overlaps))
    }

    /// The rule set in effect right now.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validate and atomically swap in a new rule set.
    pub fn replace(&self, rules: Vec<BranchRule>, tie_break: TieBreak) -> Result<Vec<RuleOverlap>> {
        let (set, overlaps) = RuleSet::compile(rules, tie_break)?;
        let next = Arc::new(set);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(event = "rules.replaced", overlaps = overlaps.len());
        Ok(overlaps)
    }

    pub fn resolve(&self, branch: &str) -> BranchResolution {
        self.snapshot().resolve(branch)
    }

    pub fn resolve_ref(&self, branch: &str, tagged: bool) -> BranchResolution {
        self.snapshot().resolve_ref(branch, tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<BranchRule> {
        vec![
            BranchRule::new("*", "sandbox"),
            BranchRule::new("feature/*", "development"),
            BranchRule::new("feature/payments/*", "payments-dev"),
            BranchRule::new("main", "staging")
                .with_lock_type(LockType::SoftLocked)
                .with_approval(1, [Role::Operator]),
            BranchRule::new("main", "production")
                .with_lock_type(LockType::HardLocked)
                .tagged_only(),
        ]
    }

    fn set() -> RuleSet {
        RuleSet::compile(rules(), TieBreak::DeclarationOrder).unwrap().0
    }

    #[test]
    fn test_longer_literal_prefix_wins() {
        let s = set();
        assert_eq!(s.resolve("feature/login").environment(), Some("development"));
        assert_eq!(
            s.resolve("feature/payments/refunds").environment(),
            Some("payments-dev")
        );
    }

    #[test]
    fn test_wildcard_is_fallback() {
        assert_eq!(set().resolve("chore/deps").environment(), Some("sandbox"));
    }

    #[test]
    fn test_tagged_only_rule_needs_tag() {
        let s = set();
        assert_eq!(s.resolve_ref("main", false).environment(), Some("staging"));
        assert_eq!(s.resolve_ref("main", true).environment(), Some("production"));
    }

    #[test]
    fn test_no_match_is_a_result() {
        let (s, _) =
            RuleSet::compile(vec![BranchRule::new("main", "staging")], TieBreak::default()).unwrap();
        assert_eq!(s.resolve("develop"), BranchResolution::NoMatch);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let (s, overlaps) = RuleSet::compile(
            vec![
                BranchRule::new("release/*", "staging"),
                BranchRule::new("release/*", "qa"),
            ],
            TieBreak::DeclarationOrder,
        )
        .unwrap();
        assert_eq!(s.resolve("release/1.0").environment(), Some("staging"));
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].winner, 0);
        assert_eq!(overlaps[0].shadowed, 1);
    }

    #[test]
    fn test_strict_tie_break_rejects_overlap() {
        let err = RuleSet::compile(
            vec![
                BranchRule::new("release/*", "staging"),
                BranchRule::new("release/*", "qa"),
            ],
            TieBreak::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidConfig(_)));
    }

    #[test]
    fn test_approval_rule_without_approvers_rejected() {
        let mut rule = BranchRule::new("main", "staging");
        rule.requires_approval = true;
        assert!(RuleSet::compile(vec![rule], TieBreak::default()).is_err());
    }

    #[test]
    fn test_replace_swaps_snapshot() {
        let (resolver, _) =
            BranchResolver::from_rules(vec![BranchRule::new("main", "staging")], TieBreak::default())
                .unwrap();
        let before = resolver.snapshot();
        resolver
            .replace(vec![BranchRule::new("main", "qa")], TieBreak::default())
            .unwrap();
        assert_eq!(before.resolve("main").environment(), Some("staging"));
        assert_eq!(resolver.resolve("main").environment(), Some("qa"));
    }
}
