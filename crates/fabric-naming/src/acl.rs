//! Per-node tagged access control (§4.D).
//!
//! Every mount-table node carries an [`Acl`] mapping each [`AclTag`] to the
//! blessing-name patterns authorized for it. Authorization walks from the
//! root down to the target node; if any ancestor denies a tag, the whole
//! operation is denied, regardless of the target node's own ACL — access
//! control strictly narrows as you descend the tree.

use std::collections::HashMap;

use fabric_security::BlessingPattern;
use serde::{Deserialize, Serialize};

/// The operations a mount-table ACL distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclTag {
    /// Permission to read a node's children (used by Glob).
    Read,
    /// Permission to resolve through a node (ResolveStep, Glob emission).
    Resolve,
    /// Permission to change a node's ACL.
    Admin,
    /// Permission to Mount/Unmount at a node.
    Mount,
}

/// A node's access-control map: one pattern list per tag, plus an
/// optimistic-concurrency version bumped on every `SetPermissions`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Acl {
    by_tag: HashMap<AclTag, Vec<BlessingPattern>>,
    version: u64,
}

impl Acl {
    /// An ACL granting nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// An ACL granting every tag to every name (used for the tree root by
    /// default, matching a freshly started mount table with no configured
    /// restrictions).
    pub fn open() -> Self {
        let mut acl = Self::new();
        for tag in [AclTag::Read, AclTag::Resolve, AclTag::Admin, AclTag::Mount] {
            acl.by_tag.insert(tag, vec![BlessingPattern::all()]);
        }
        acl
    }

    /// Grant `tag` to names matching `pattern`.
    pub fn grant(&mut self, tag: AclTag, pattern: BlessingPattern) {
        self.by_tag.entry(tag).or_default().push(pattern);
    }

    /// Whether any of `names` is authorized for `tag` at this node alone
    /// (ancestor authorization is the caller's responsibility; see
    /// [`crate::mount_table::MountTable`]).
    pub fn authorizes(&self, tag: AclTag, names: &[String]) -> bool {
        self.by_tag
            .get(&tag)
            .map(|patterns| {
                patterns
                    .iter()
                    .any(|p| p.matches_any(names.iter().map(String::as_str)))
            })
            .unwrap_or(false)
    }

    /// The current optimistic-concurrency version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// A clone of the tag-to-pattern grant map, for `GetPermissions`.
    pub fn by_tag_clone(&self) -> HashMap<AclTag, Vec<BlessingPattern>> {
        self.by_tag.clone()
    }

    /// Replace this ACL's entries, bumping its version, iff `expected_version`
    /// matches the current one.
    pub fn set(&mut self, by_tag: HashMap<AclTag, Vec<BlessingPattern>>, expected_version: u64) -> Result<(), (u64, u64)> {
        if expected_version != self.version {
            return Err((expected_version, self.version));
        }
        self.by_tag = by_tag;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_acl_authorizes_everyone_for_every_tag() {
        let acl = Acl::open();
        let names = vec!["anyone".to_string()];
        assert!(acl.authorizes(AclTag::Read, &names));
        assert!(acl.authorizes(AclTag::Mount, &names));
    }

    #[test]
    fn empty_acl_authorizes_nobody() {
        let acl = Acl::new();
        let names = vec!["anyone".to_string()];
        assert!(!acl.authorizes(AclTag::Read, &names));
    }

    #[test]
    fn grant_restricts_to_matching_pattern() {
        let mut acl = Acl::new();
        acl.grant(AclTag::Mount, BlessingPattern::new("alice.…"));
        assert!(acl.authorizes(AclTag::Mount, &["alice.device".to_string()]));
        assert!(!acl.authorizes(AclTag::Mount, &["bob".to_string()]));
    }

    #[test]
    fn set_rejects_stale_version() {
        let mut acl = Acl::new();
        let result = acl.set(HashMap::new(), 5);
        assert_eq!(result, Err((5, 0)));
    }

    #[test]
    fn set_bumps_version_on_success() {
        let mut acl = Acl::new();
        acl.set(HashMap::new(), 0).expect("set");
        assert_eq!(acl.version(), 1);
    }
}
