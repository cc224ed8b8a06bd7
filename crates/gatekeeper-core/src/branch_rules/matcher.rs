//! Branch name matchers, one per pattern kind.
//!
//! - `ExactMatcher`: no wildcard, literal equality
//! - `PrefixMatcher`: a single trailing `*`, e.g. `feature/*`
//! - `GlobMatcher`: anything else; `*` matches any run of characters
//!   (including `/`), `?` matches exactly one

use std::fmt;

use regex::Regex;

/// How specific a pattern is. Higher wins.
///
/// Ordered `Wildcard < Literal(n) < Exact(n)`; among literals a longer
/// non-wildcard prefix is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Specificity {
    /// Pattern starts with a wildcard.
    Wildcard,
    /// Length of the literal prefix before the first wildcard.
    Literal(usize),
    /// Pattern has no wildcard at all.
    Exact(usize),
}

impl fmt::Display for Specificity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => write!(f, "wildcard"),
            Self::Literal(n) => write!(f, "literal prefix {n}"),
            Self::Exact(n) => write!(f, "exact {n}"),
        }
    }
}

/// A compiled branch pattern.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Whether the branch name matches this pattern.
    fn matches(&self, branch: &str) -> bool;

    /// Precedence of this pattern relative to others.
    fn specificity(&self) -> Specificity;

    /// The non-wildcard prefix of the pattern.
    fn literal_prefix(&self) -> &str;
}

fn is_wildcard(c: char) -> bool {
    matches!(c, '*' | '?')
}

/// Compile a pattern into the cheapest matcher that implements it.
pub fn compile(pattern: &str) -> Result<Box<dyn Matcher>, String> {
    if pattern.trim().is_empty() {
        return Err("pattern must not be empty".to_string());
    }
    let wildcard_at = pattern.find(is_wildcard);
    match wildcard_at {
        None => Ok(Box::new(ExactMatcher {
            literal: pattern.to_string(),
        })),
        Some(idx) if idx == pattern.len() - 1 && pattern.ends_with('*') => {
            Ok(Box::new(PrefixMatcher {
                prefix: pattern[..idx].to_string(),
            }))
        }
        Some(idx) => GlobMatcher::new(pattern, idx).map(|m| Box::new(m) as Box<dyn Matcher>),
    }
}

/// Literal equality.
#[derive(Debug, Clone)]
pub struct ExactMatcher {
    literal: String,
}

impl Matcher for ExactMatcher {
    fn matches(&self, branch: &str) -> bool {
        branch == self.literal
    }

    fn specificity(&self) -> Specificity {
        Specificity::Exact(self.literal.len())
    }

    fn literal_prefix(&self) -> &str {
        &self.literal
    }
}

/// `prefix*`
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefix: String,
}

impl Matcher for PrefixMatcher {
    fn matches(&self, branch: &str) -> bool {
        branch.starts_with(&self.prefix)
    }

    fn specificity(&self) -> Specificity {
        if self.prefix.is_empty() {
            Specificity::Wildcard
        } else {
            Specificity::Literal(self.prefix.len())
        }
    }

    fn literal_prefix(&self) -> &str {
        &self.prefix
    }
}

/// General glob compiled to an anchored regex.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    prefix: String,
    regex: Regex,
}

impl GlobMatcher {
    fn new(pattern: &str, first_wildcard: usize) -> Result<Self, String> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        let mut literal = String::new();
        for c in pattern.chars() {
            if is_wildcard(c) {
                source.push_str(&regex::escape(&literal));
                literal.clear();
                source.push_str(if c == '*' { ".*" } else { "." });
            } else {
                literal.push(c);
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');
        let regex = Regex::new(&source).map_err(|e| format!("invalid pattern {pattern}: {e}"))?;
        Ok(Self {
            prefix: pattern[..first_wildcard].to_string(),
            regex,
        })
    }
}

impl Matcher for GlobMatcher {
    fn matches(&self, branch: &str) -> bool {
        self.regex.is_match(branch)
    }

    fn specificity(&self) -> Specificity {
        if self.prefix.is_empty() {
            Specificity::Wildcard
        } else {
            Specificity::Literal(self.prefix.len())
        }
    }

    fn literal_prefix(&self) -> &str {
        &self.prefix
    }
}
