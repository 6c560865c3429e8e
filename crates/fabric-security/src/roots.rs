//! `BlessingRoots`: the set of root keys a principal trusts, and the name
//! prefixes each is authorized to certify (§4.B).

use std::collections::HashMap;
use std::sync::RwLock;

use fabric_crypto::ed25519::VerifyingKey;

use crate::pattern::BlessingPattern;

/// Maps a public key to the set of blessing patterns that key is authorized
/// to certify.
#[derive(Default)]
pub struct BlessingRoots {
    by_key: RwLock<HashMap<VerifyingKey, Vec<BlessingPattern>>>,
}

impl BlessingRoots {
    /// An empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `root_key` as authoritative over names matching `pattern`.
    pub fn add(&self, root_key: VerifyingKey, pattern: BlessingPattern) {
        self.by_key
            .write()
            .expect("blessing roots lock poisoned")
            .entry(root_key)
            .or_default()
            .push(pattern);
    }

    /// Whether `root_key` has authority over `blessing_name` under any
    /// pattern registered for it.
    pub fn recognized(&self, root_key: &VerifyingKey, blessing_name: &str) -> bool {
        self.by_key
            .read()
            .expect("blessing roots lock poisoned")
            .get(root_key)
            .map(|patterns| patterns.iter().any(|p| p.matches(blessing_name)))
            .unwrap_or(false)
    }

    /// Every pattern registered for `root_key`, if any.
    pub fn patterns_for(&self, root_key: &VerifyingKey) -> Vec<BlessingPattern> {
        self.by_key
            .read()
            .expect("blessing roots lock poisoned")
            .get(root_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Export every `(key, patterns)` entry, for persistence (§4.L).
    pub fn export(&self) -> Vec<(VerifyingKey, Vec<BlessingPattern>)> {
        self.by_key
            .read()
            .expect("blessing roots lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Rebuild a root set from entries previously produced by
    /// [`export`](Self::export).
    pub fn import(entries: Vec<(VerifyingKey, Vec<BlessingPattern>)>) -> Self {
        Self {
            by_key: RwLock::new(entries.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_name_matching_registered_pattern() {
        let roots = BlessingRoots::new();
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        roots.add(kp.verifying_key.clone(), BlessingPattern::new("alice.…"));
        assert!(roots.recognized(&kp.verifying_key, "alice.friend"));
        assert!(!roots.recognized(&kp.verifying_key, "bob"));
    }

    #[test]
    fn unregistered_key_recognizes_nothing() {
        let roots = BlessingRoots::new();
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        assert!(!roots.recognized(&kp.verifying_key, "anything"));
    }

    #[test]
    fn multiple_patterns_per_key_accumulate() {
        let roots = BlessingRoots::new();
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        roots.add(kp.verifying_key.clone(), BlessingPattern::new("alice"));
        roots.add(kp.verifying_key.clone(), BlessingPattern::new("bob.…"));
        assert!(roots.recognized(&kp.verifying_key, "alice"));
        assert!(roots.recognized(&kp.verifying_key, "bob.friend"));
        assert!(!roots.recognized(&kp.verifying_key, "carol"));
    }
}
