//! The in-memory mount-table tree (§4.D).
//!
//! A single read-write lock guards the whole tree — mount operations are
//! rare relative to resolves, and resolves are short, so the contention
//! this implies is an acceptable trade for a simple consistency argument
//! (§5, §9).

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::acl::{Acl, AclTag};
use crate::{NamingError, Result};

/// One live server registered at a mount point.
#[derive(Clone, Debug)]
pub struct MountEntry {
    /// The server name (an endpoint string, or any opaque server address).
    pub server: String,
    /// Absolute unix-second expiry.
    pub expiry: u64,
}

/// `Replace` drops the existing server list before mounting; `mt` marks the
/// mount point as itself a mount table, required for recursive resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct MountFlags {
    /// Drop any existing servers at this name before adding the new one.
    pub replace: bool,
    /// Whether the mounted server is itself a mount table.
    pub mt: bool,
}

/// What `ResolveStep` returns: the live servers at the mount point reached,
/// the unconsumed suffix, and whether that mount point is itself a mount
/// table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveStepResult {
    /// Servers registered at the mount point that was reached.
    pub servers: Vec<String>,
    /// Path components not yet consumed.
    pub suffix: String,
    /// Whether the reached mount point is itself a mount table.
    pub is_mount_table: bool,
}

/// One entry emitted by `Glob`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobEntry {
    /// The full name of the matched node, relative to the tree root.
    pub name: String,
    /// Servers registered at this node, if it has an active mount.
    pub servers: Vec<String>,
    /// Whether this node's mount is itself a mount table.
    pub is_mount_table: bool,
    /// Whatever pattern tail was left unconsumed when this mount point was
    /// reached. Non-empty here means the caller (the resolver's federated
    /// `Glob`, §4.E) still owes a further `Glob(remaining_pattern)` against
    /// this entry's servers to see what lies beyond the mount.
    pub remaining_pattern: String,
}

struct Mount {
    servers: Vec<MountEntry>,
    is_mount_table: bool,
}

#[derive(Default)]
struct Node {
    mount: Option<Mount>,
    children: BTreeMap<String, Node>,
    /// `None` means this node has no ACL of its own and inherits whatever
    /// its nearest explicitly-ACL'd ancestor allows; intermediate nodes
    /// created implicitly by `Mount` start this way, so mounting under an
    /// open root doesn't accidentally lock descendants out.
    acl: Option<Acl>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.mount.is_none() && self.children.is_empty()
    }

    fn prune_expired(&mut self, now: u64) {
        if let Some(mount) = &mut self.mount {
            mount.servers.retain(|s| s.expiry > now);
            if mount.servers.is_empty() {
                self.mount = None;
            }
        }
    }
}

/// The mount-table tree.
pub struct MountTable {
    root: RwLock<Node>,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// A fresh, empty mount table with an open root ACL.
    pub fn new() -> Self {
        let mut root = Node::default();
        root.acl = Some(Acl::open());
        MountTable {
            root: RwLock::new(root),
        }
    }

    fn split(name: &str) -> Vec<String> {
        name.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect()
    }

    /// Authorize `names` for `tag` along the path `components`, from the
    /// root down to (and including) the target node. Any denying ancestor
    /// fails the whole check.
    fn authorize_path(root: &Node, components: &[String], tag: AclTag, caller_names: &[String]) -> Result<()> {
        // `root.acl` is always `Some` (set in `new`); every other node with
        // no ACL of its own inherits whatever the walk has authorized so far.
        if let Some(acl) = &root.acl {
            if !acl.authorizes(tag, caller_names) {
                return Err(NamingError::NoAccess(tag));
            }
        }
        let mut node = root;
        for component in components {
            let Some(child) = node.children.get(component) else {
                // No node here yet (e.g. about to be created by Mount); no
                // further ACL to check below the deepest existing ancestor.
                return Ok(());
            };
            if let Some(acl) = &child.acl {
                if !acl.authorizes(tag, caller_names) {
                    return Err(NamingError::NoAccess(tag));
                }
            }
            node = child;
        }
        Ok(())
    }

    /// Mount `server` at `name` for `ttl_secs` starting at `now`.
    pub fn mount(
        &self,
        name: &str,
        server: &str,
        ttl_secs: u64,
        now: u64,
        flags: MountFlags,
        caller_names: &[String],
    ) -> Result<()> {
        let components = Self::split(name);
        let mut root = self.root.write().expect("mount table lock poisoned");
        Self::authorize_path(&root, &components, AclTag::Mount, caller_names)?;

        let mut node = &mut *root;
        for component in &components {
            node = node.children.entry(component.clone()).or_default();
        }

        let expiry = now + ttl_secs;
        match &mut node.mount {
            Some(existing) if !flags.replace => {
                if existing.is_mount_table != flags.mt {
                    return Err(NamingError::MtFlagMismatch(name.to_string()));
                }
                if let Some(entry) = existing.servers.iter_mut().find(|s| s.server == server) {
                    entry.expiry = expiry;
                } else {
                    existing.servers.push(MountEntry {
                        server: server.to_string(),
                        expiry,
                    });
                }
            }
            _ => {
                node.mount = Some(Mount {
                    servers: vec![MountEntry {
                        server: server.to_string(),
                        expiry,
                    }],
                    is_mount_table: flags.mt,
                });
            }
        }
        Ok(())
    }

    /// Remove `server` from `name`'s mount (or every server there if
    /// `server` is `None`), then prune any now-empty ancestors.
    pub fn unmount(&self, name: &str, server: Option<&str>, caller_names: &[String]) -> Result<()> {
        let components = Self::split(name);
        let mut root = self.root.write().expect("mount table lock poisoned");
        Self::authorize_path(&root, &components, AclTag::Mount, caller_names)?;

        remove_mount(&mut root, &components, server);
        Ok(())
    }

    /// Walk from the root consuming `name`'s components. Stops at the first
    /// node with a non-expired mount; lazily prunes expired servers found
    /// along the way.
    pub fn resolve_step(&self, name: &str, now: u64, caller_names: &[String]) -> Result<ResolveStepResult> {
        let components = Self::split(name);
        let mut root = self.root.write().expect("mount table lock poisoned");
        Self::authorize_path(&root, &components, AclTag::Resolve, caller_names)?;

        root.prune_expired(now);
        let result = if let Some(mount) = &root.mount {
            Ok(ResolveStepResult {
                servers: mount.servers.iter().map(|s| s.server.clone()).collect(),
                suffix: components.join("/"),
                is_mount_table: mount.is_mount_table,
            })
        } else {
            Self::resolve_step_walk(&mut root, name, &components, now)
        };
        // Whether this walk found a live mount or not, any node it stepped
        // through whose mount just expired may now be empty; prune it (and
        // recursively any ancestor left empty by that) per the tree's
        // eager-GC invariant (§3, §8 "Mount GC").
        gc_path(&mut root, &components);
        result
    }

    fn resolve_step_walk(root: &mut Node, name: &str, components: &[String], now: u64) -> Result<ResolveStepResult> {
        let mut node = root;
        for (i, component) in components.iter().enumerate() {
            let Some(child) = node.children.get_mut(component) else {
                return Err(NamingError::NoSuchName(name.to_string()));
            };
            child.prune_expired(now);
            node = child;
            if let Some(mount) = &node.mount {
                let suffix = components[i + 1..].join("/");
                return Ok(ResolveStepResult {
                    servers: mount.servers.iter().map(|s| s.server.clone()).collect(),
                    suffix,
                    is_mount_table: mount.is_mount_table,
                });
            }
        }
        if name.is_empty() {
            Err(NamingError::NoSuchNameRoot)
        } else {
            Err(NamingError::NoSuchName(name.to_string()))
        }
    }

    /// Stream every node matching `pattern` (`*` = one component, `**` =
    /// any suffix). Descent stops at mount points; nodes the caller lacks
    /// `Resolve` for are skipped silently rather than erroring the whole
    /// glob.
    pub fn glob(&self, pattern: &str, now: u64, caller_names: Vec<String>) -> mpsc::UnboundedReceiver<GlobEntry> {
        // Unbounded: the walk below is synchronous and runs to completion
        // before anyone can drain the channel, so a bounded channel would
        // start silently dropping matches past its capacity the moment a
        // glob produced more hits than the buffer held.
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern_components = Self::split(pattern);

        // Take a write lock for the duration of the walk: GC of expired
        // entries happens inline (§9 resolved open question), trading a
        // small amount of glob latency for a simpler consistency story.
        let mut root = self.root.write().expect("mount table lock poisoned");
        root.prune_expired(now);
        walk_glob(&mut root, &pattern_components, String::new(), now, &caller_names, &tx);
        // tx is dropped here, closing the channel once the synchronous walk
        // above has sent every entry.
        rx
    }

    /// The current ACL grants and version at `name`, for `GetPermissions`. A
    /// node with no ACL of its own (inheriting an ancestor's) reports an
    /// empty grant map at version 0.
    pub fn permissions(&self, name: &str) -> (std::collections::HashMap<AclTag, Vec<fabric_security::BlessingPattern>>, u64) {
        let components = Self::split(name);
        let root = self.root.read().expect("mount table lock poisoned");
        let mut node = &*root;
        for component in &components {
            match node.children.get(component) {
                Some(child) => node = child,
                None => return (std::collections::HashMap::new(), 0),
            }
        }
        match &node.acl {
            Some(acl) => (acl.by_tag_clone(), acl.version()),
            None => (std::collections::HashMap::new(), 0),
        }
    }

    /// Current ACL version at `name`, for optimistic-concurrency
    /// `SetPermissions`.
    pub fn permissions_version(&self, name: &str) -> u64 {
        let components = Self::split(name);
        let root = self.root.read().expect("mount table lock poisoned");
        let mut node = &*root;
        for component in &components {
            match node.children.get(component) {
                Some(child) => node = child,
                None => return 0,
            }
        }
        node.acl.as_ref().map(Acl::version).unwrap_or(0)
    }

    /// Replace the ACL at `name`, iff `expected_version` matches. A node
    /// that doesn't exist yet behaves as if it had version 0; it is only
    /// created in the tree if the version check actually succeeds, so a
    /// failed call never leaves behind a stray deny-all node.
    pub fn set_permissions(
        &self,
        name: &str,
        acl: std::collections::HashMap<AclTag, Vec<fabric_security::BlessingPattern>>,
        expected_version: u64,
        caller_names: &[String],
    ) -> Result<()> {
        let components = Self::split(name);
        let mut root = self.root.write().expect("mount table lock poisoned");
        Self::authorize_path(&root, &components, AclTag::Admin, caller_names)?;

        let existing_version = {
            let mut node = &*root;
            let mut found = true;
            for component in &components {
                match node.children.get(component) {
                    Some(child) => node = child,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                node.acl.as_ref().map(Acl::version).unwrap_or(0)
            } else {
                0
            }
        };
        if existing_version != expected_version {
            return Err(NamingError::BadVersion {
                expected: expected_version,
                found: existing_version,
            });
        }

        let mut node = &mut *root;
        for component in &components {
            node = node.children.entry(component.clone()).or_default();
        }
        node.acl
            .get_or_insert_with(Acl::new)
            .set(acl, expected_version)
            .map_err(|(expected, found)| NamingError::BadVersion { expected, found })
    }
}

/// Removes any node along `components` that has become empty (no children,
/// no active mount), pruning from the leaf back up to (but not including)
/// `node` itself. Safe to call after a read-only walk too: a node that is
/// still non-empty is left untouched.
fn gc_path(node: &mut Node, components: &[String]) -> bool {
    if components.is_empty() {
        return node.is_empty();
    }
    let head = &components[0];
    if let Some(child) = node.children.get_mut(head) {
        if gc_path(child, &components[1..]) {
            node.children.remove(head);
        }
    }
    node.is_empty()
}

fn remove_mount(node: &mut Node, components: &[String], server: Option<&str>) -> bool {
    if components.is_empty() {
        if let Some(mount) = &mut node.mount {
            match server {
                Some(s) => mount.servers.retain(|entry| entry.server != s),
                None => mount.servers.clear(),
            }
            if mount.servers.is_empty() {
                node.mount = None;
            }
        }
        return node.is_empty();
    }

    let head = &components[0];
    let child_now_empty = match node.children.get_mut(head) {
        Some(child) => remove_mount(child, &components[1..], server),
        None => return node.is_empty(),
    };
    if child_now_empty {
        node.children.remove(head);
    }
    node.is_empty()
}

/// Walks `node` and its descendants against `remaining_pattern`, lazily
/// pruning each visited node's expired servers on the way down (mirroring
/// `ResolveStep`'s per-node `prune_expired`) so a `Glob` issued with no
/// preceding `ResolveStep` still never reports a server past its TTL.
fn walk_glob(
    node: &mut Node,
    remaining_pattern: &[String],
    name_so_far: String,
    now: u64,
    caller_names: &[String],
    tx: &mpsc::UnboundedSender<GlobEntry>,
) {
    node.prune_expired(now);

    if let Some(acl) = &node.acl {
        if !acl.authorizes(AclTag::Resolve, caller_names) {
            return;
        }
    }

    // A mount point is emitted and descent stops there unconditionally,
    // whether or not the pattern still has a tail (§4.D: "When a mount
    // point is encountered at or before the pattern is exhausted, emit it
    // and stop descending"). Any unconsumed tail travels with the entry so
    // the resolver's federated Glob (§4.E) can reissue it against the
    // mounted servers.
    if let Some(mount) = &node.mount {
        let entry = GlobEntry {
            name: name_so_far,
            servers: mount.servers.iter().map(|s| s.server.clone()).collect(),
            is_mount_table: mount.is_mount_table,
            remaining_pattern: remaining_pattern.join("/"),
        };
        // An unbounded send only fails if the receiver has already been
        // dropped (the caller stopped listening); every match still gets
        // produced, none are silently dropped for lack of buffer space.
        let _ = tx.send(entry);
        return;
    }

    if remaining_pattern.is_empty() {
        return;
    }

    let head = &remaining_pattern[0];
    let rest = &remaining_pattern[1..];

    if head == "**" {
        // Match zero or more components: descend into every child, keeping
        // "**" active. (A zero-component match on `node` itself only
        // matters when `node` has a mount, which the check above already
        // emitted and returned from.)
        let mut empty_children = Vec::new();
        for (component, child) in node.children.iter_mut() {
            let child_name = join(&name_so_far, component);
            walk_glob(child, remaining_pattern, child_name, now, caller_names, tx);
            if child.is_empty() {
                empty_children.push(component.clone());
            }
        }
        for component in empty_children {
            node.children.remove(&component);
        }
        return;
    }

    if head == "*" {
        let mut empty_children = Vec::new();
        for (component, child) in node.children.iter_mut() {
            let child_name = join(&name_so_far, component);
            walk_glob(child, rest, child_name, now, caller_names, tx);
            if child.is_empty() {
                empty_children.push(component.clone());
            }
        }
        for component in empty_children {
            node.children.remove(&component);
        }
        return;
    }

    if let Some(child) = node.children.get_mut(head) {
        let child_name = join(&name_so_far, head);
        walk_glob(child, rest, child_name, now, caller_names, tx);
        if child.is_empty() {
            node.children.remove(head);
        }
    }
}

fn join(prefix: &str, component: &str) -> String {
    if prefix.is_empty() {
        component.to_string()
    } else {
        format!("{prefix}/{component}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_acl_restriction() -> Vec<String> {
        vec!["anyone".to_string()]
    }

    #[test]
    fn mount_then_resolve_step_exact() {
        let mt = MountTable::new();
        mt.mount("a/b/c", "tcp:127.0.0.1:2222", 60, 0, MountFlags::default(), &no_acl_restriction())
            .expect("mount");
        let result = mt.resolve_step("a/b/c", 0, &no_acl_restriction()).expect("resolve");
        assert_eq!(result.servers, vec!["tcp:127.0.0.1:2222".to_string()]);
        assert_eq!(result.suffix, "");
    }

    #[test]
    fn resolve_step_stops_at_mount_and_returns_suffix() {
        let mt = MountTable::new();
        mt.mount(
            "a/b",
            "tcp:127.0.0.1:1111",
            60,
            0,
            MountFlags { replace: false, mt: true },
            &no_acl_restriction(),
        )
        .expect("mount");
        let result = mt.resolve_step("a/b/c", 0, &no_acl_restriction()).expect("resolve");
        assert_eq!(result.servers, vec!["tcp:127.0.0.1:1111".to_string()]);
        assert_eq!(result.suffix, "c");
        assert!(result.is_mount_table);
    }

    #[test]
    fn resolve_step_missing_name_fails() {
        let mt = MountTable::new();
        let err = mt.resolve_step("nope", 0, &no_acl_restriction());
        assert!(matches!(err, Err(NamingError::NoSuchName(_))));
    }

    #[test]
    fn mt_flag_mismatch_rejected() {
        let mt = MountTable::new();
        mt.mount("p", "s1", 60, 0, MountFlags { replace: false, mt: true }, &no_acl_restriction())
            .expect("mount");
        let err = mt.mount("p", "s2", 60, 0, MountFlags { replace: false, mt: false }, &no_acl_restriction());
        assert!(matches!(err, Err(NamingError::MtFlagMismatch(_))));
    }

    #[test]
    fn replace_flag_drops_existing_servers() {
        let mt = MountTable::new();
        mt.mount("p", "s1", 60, 0, MountFlags::default(), &no_acl_restriction()).expect("mount");
        mt.mount("p", "s2", 60, 0, MountFlags { replace: true, mt: false }, &no_acl_restriction())
            .expect("mount");
        let result = mt.resolve_step("p", 0, &no_acl_restriction()).expect("resolve");
        assert_eq!(result.servers, vec!["s2".to_string()]);
    }

    #[test]
    fn expiry_pruning_removes_node_and_ancestors() {
        let mt = MountTable::new();
        mt.mount("p", "s1", 1, 0, MountFlags::default(), &no_acl_restriction()).expect("mount");
        let err = mt.resolve_step("p", 10, &no_acl_restriction());
        assert!(matches!(err, Err(NamingError::NoSuchName(_))));
        // The node should have been GC'd: mounting a sibling and globbing
        // "*" must not reveal a ghost "p" entry.
        let mut rx = mt.glob("*", 10, no_acl_restriction());
        let mut names = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            names.push(entry.name);
        }
        assert!(!names.contains(&"p".to_string()));
    }

    #[test]
    fn federated_style_two_level_mount_and_glob() {
        let mt = MountTable::new();
        mt.mount("x", "tcp:m2:0", 60, 0, MountFlags { replace: false, mt: true }, &no_acl_restriction())
            .expect("mount x");
        let mut rx = mt.glob("x", 0, no_acl_restriction());
        let entry = rx.try_recv().expect("entry");
        assert_eq!(entry.name, "x");
        assert!(entry.is_mount_table);
    }

    #[test]
    fn glob_star_matches_one_component() {
        let mt = MountTable::new();
        mt.mount("a", "s1", 60, 0, MountFlags::default(), &no_acl_restriction()).expect("mount a");
        mt.mount("b", "s2", 60, 0, MountFlags::default(), &no_acl_restriction()).expect("mount b");
        let mut rx = mt.glob("*", 0, no_acl_restriction());
        let mut names = vec![];
        while let Ok(entry) = rx.try_recv() {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn glob_reports_every_match_past_the_old_channel_capacity() {
        // Regression test: `glob` used to hand matches to a bounded
        // `mpsc::channel(64)` while nothing drained it until the whole
        // synchronous walk had finished, so the 65th and every later match
        // silently hit `TrySendError::Full` and never made it to `rx`.
        let mt = MountTable::new();
        let count = 200;
        for i in 0..count {
            mt.mount(&format!("n{i}"), "s", 60, 0, MountFlags::default(), &no_acl_restriction())
                .expect("mount");
        }
        let mut rx = mt.glob("*", 0, no_acl_restriction());
        let mut names = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            names.push(entry.name);
        }
        assert_eq!(names.len(), count);
    }

    #[test]
    fn ancestor_acl_denial_blocks_descendant_resolve() {
        let mt = MountTable::new();
        mt.mount("a/b", "s1", 60, 0, MountFlags::default(), &no_acl_restriction())
            .expect("mount");
        // Lock down the root to deny Resolve to everyone.
        mt.set_permissions("", std::collections::HashMap::new(), 0, &no_acl_restriction())
            .expect("set root acl");
        let err = mt.resolve_step("a/b", 0, &no_acl_restriction());
        assert!(matches!(err, Err(NamingError::NoAccess(AclTag::Resolve))));
    }

    #[test]
    fn bad_version_rejected() {
        let mt = MountTable::new();
        let err = mt.set_permissions("a", std::collections::HashMap::new(), 5, &no_acl_restriction());
        assert!(matches!(err, Err(NamingError::BadVersion { .. })));
    }
}
