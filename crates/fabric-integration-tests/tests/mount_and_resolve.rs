//! Integration test: basic mount + resolve (spec scenario 1).
//!
//! Mounts a server at "a/b" with the MT flag, then a second server under it
//! at "a/b/c" without MT, and confirms `ResolveStep` walks straight to the
//! deepest mount with an empty suffix rather than stopping at "a/b".

use fabric_naming::mount_table::{MountFlags, MountTable};

const NOBODY: &[String] = &[];

#[test]
fn mount_then_resolve_reaches_the_deepest_mount_point() {
    let table = MountTable::new();

    table
        .mount(
            "a/b",
            "tcp:127.0.0.1:1111",
            60,
            0,
            MountFlags { replace: false, mt: true },
            NOBODY,
        )
        .expect("mount a/b as a mount table");

    table
        .mount(
            "a/b/c",
            "tcp:127.0.0.1:2222",
            60,
            0,
            MountFlags::default(),
            NOBODY,
        )
        .expect("mount a/b/c as a terminal server");

    let result = table.resolve_step("a/b/c", 0, NOBODY).expect("resolve a/b/c");
    assert_eq!(result.servers, vec!["tcp:127.0.0.1:2222".to_string()]);
    assert_eq!(result.suffix, "");
    assert!(!result.is_mount_table);

    // The intermediate mount point is still reachable on its own and still
    // reports itself as a mount table.
    let intermediate = table.resolve_step("a/b", 0, NOBODY).expect("resolve a/b");
    assert_eq!(intermediate.servers, vec!["tcp:127.0.0.1:1111".to_string()]);
    assert!(intermediate.is_mount_table);
}

#[test]
fn resolving_an_unmounted_name_fails_with_no_such_name() {
    let table = MountTable::new();
    table
        .mount("a/b", "tcp:127.0.0.1:1111", 60, 0, MountFlags::default(), NOBODY)
        .expect("mount");

    let err = table.resolve_step("a/x", 0, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));
}

#[test]
fn mounting_with_conflicting_mt_flag_on_a_live_mount_fails() {
    let table = MountTable::new();
    table
        .mount("svc", "tcp:127.0.0.1:1", 60, 0, MountFlags { replace: false, mt: true }, NOBODY)
        .expect("first mount");

    let err = table
        .mount("svc", "tcp:127.0.0.1:2", 60, 0, MountFlags { replace: false, mt: false }, NOBODY)
        .unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::MtFlagMismatch(_)));
}

#[test]
fn unmount_removes_a_single_server_and_prunes_empty_ancestors() {
    let table = MountTable::new();
    table
        .mount("a/b/c", "tcp:127.0.0.1:1", 60, 0, MountFlags::default(), NOBODY)
        .expect("mount");

    table.unmount("a/b/c", Some("tcp:127.0.0.1:1"), NOBODY).expect("unmount");

    let err = table.resolve_step("a/b/c", 0, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));
    // "a" and "a/b" existed only to hold "a/b/c"'s mount; both should be gone.
    let err = table.resolve_step("a", 0, NOBODY).unwrap_err();
    assert!(matches!(err, fabric_naming::NamingError::NoSuchName(_)));
}
