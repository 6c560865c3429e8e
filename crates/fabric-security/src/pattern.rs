//! Blessing pattern matching (§4.B).
//!
//! A pattern is a dot-separated sequence of extensions, optionally ending in
//! the wildcard token `…`. `a.b` matches exactly the name `a.b`; `a.b.…`
//! matches `a.b` and any (non-empty) extension of it; the bare pattern `…`
//! matches every name. Matching is case-sensitive.

use serde::{Deserialize, Serialize};

/// The wildcard extension token.
pub const WILDCARD: &str = "…";

/// A blessing pattern, as used by `BlessingStore::Set`/`ForPeer` and
/// `BlessingRoots`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlessingPattern(String);

impl BlessingPattern {
    /// Wrap a raw pattern string. No validation is performed beyond storing
    /// it verbatim; matching itself never panics on any input.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The pattern that matches every name.
    pub fn all() -> Self {
        Self(WILDCARD.to_string())
    }

    /// The underlying pattern string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this pattern matches the given blessing name.
    ///
    /// `a.b` matches only `a.b`. `a.b.…` matches `a.b` and `a.b.<anything>`.
    /// The bare `…` matches everything, including the empty name.
    pub fn matches(&self, name: &str) -> bool {
        if self.0 == WILDCARD {
            return true;
        }
        match self.0.strip_suffix(&format!(".{WILDCARD}")) {
            Some(prefix) => name == prefix || name.starts_with(&format!("{prefix}.")),
            None => name == self.0,
        }
    }

    /// Whether this pattern matches at least one of the given names.
    pub fn matches_any<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        names.into_iter().any(|n| self.matches(n))
    }
}

impl std::fmt::Display for BlessingPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlessingPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BlessingPattern {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_itself() {
        let p = BlessingPattern::new("alice.friend");
        assert!(p.matches("alice.friend"));
        assert!(!p.matches("alice.friend.phone"));
        assert!(!p.matches("alice"));
    }

    #[test]
    fn wildcard_suffix_matches_prefix_and_extensions() {
        let p = BlessingPattern::new(format!("alice.{WILDCARD}"));
        assert!(p.matches("alice"));
        assert!(p.matches("alice.friend"));
        assert!(p.matches("alice.friend.phone"));
        assert!(!p.matches("bob"));
        assert!(!p.matches("alice2"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        let p = BlessingPattern::all();
        assert!(p.matches(""));
        assert!(p.matches("anything.at.all"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let p = BlessingPattern::new("Alice");
        assert!(!p.matches("alice"));
    }

    #[test]
    fn matches_any_checks_every_name() {
        let p = BlessingPattern::new(format!("alice.{WILDCARD}"));
        assert!(p.matches_any(["bob", "alice.friend"]));
        assert!(!p.matches_any(["bob", "carol"]));
    }

    #[test]
    fn wildcard_suffix_does_not_match_unrelated_prefix_sharing_chars() {
        let p = BlessingPattern::new(format!("alice.{WILDCARD}"));
        // "alice2" shares a string prefix with "alice" but is not a dotted
        // extension of it.
        assert!(!p.matches("alice2.friend"));
    }
}
