//! Integration test: mount expiry and garbage collection (spec scenario 3).
//!
//! Mounts a server with a 1-second TTL, advances the clock past it, and
//! confirms the server is gone from both `ResolveStep` and `Glob`, and that
//! the now-empty parent has been pruned away too.

use fabric_naming::mount_table::{MountFlags, MountTable};

const NOBODY: &[String] = &[];

#[tokio::test]
async fn expired_mounts_vanish_from_resolve_and_glob_and_prune_their_parent() {
    let table = MountTable::new();
    table
        .mount("p/leaf", "tcp:127.0.0.1:1", 1, 0, MountFlags::default(), NOBODY)
        .expect("mount with a 1s ttl at t=0");

    // Still resolvable just before expiry.
    let before = table.resolve_step("p/leaf", 0, NOBODY).expect("resolve before expiry");
    assert_eq!(before.servers, vec!["tcp:127.0.0.1:1".to_string()]);

    // Advance the clock past the ttl.
    let err = table.resolve_step("p/leaf", 2, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));

    // Glob over the parent returns nothing once the lazy prune has run.
    let mut rx = table.glob("p/*", 2, Vec::new());
    assert!(rx.recv().await.is_none(), "glob must not report the expired mount");

    // The parent "p" existed only to hold "p/leaf"; it must be gone too.
    let err = table.resolve_step("p", 2, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));
}

#[tokio::test]
async fn a_sibling_keeps_the_parent_alive_after_one_child_expires() {
    let table = MountTable::new();
    table
        .mount("p/short", "tcp:127.0.0.1:1", 1, 0, MountFlags::default(), NOBODY)
        .expect("short-lived mount");
    table
        .mount("p/long", "tcp:127.0.0.1:2", 1000, 0, MountFlags::default(), NOBODY)
        .expect("long-lived mount");

    let err = table.resolve_step("p/short", 2, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));

    // "p/long" keeps "p" alive even though "p/short" expired.
    let still_there = table.resolve_step("p/long", 2, NOBODY).expect("resolve surviving sibling");
    assert_eq!(still_there.servers, vec!["tcp:127.0.0.1:2".to_string()]);
}
