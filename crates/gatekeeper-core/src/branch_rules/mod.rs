//! Branch pattern rules mapping refs to deployment environments.
//!
//! Patterns are compiled once into matchers. Resolution picks the most
//! specific matching rule: exact names beat wildcard patterns, and among
//! wildcard patterns a longer literal prefix wins.

pub mod matcher;
pub mod resolver;

pub use matcher::{compile, Matcher, Specificity};
pub use resolver::{
    BranchResolution, BranchResolver, BranchRule, RuleMatch, RuleOverlap, RuleSet, TieBreak,
};
