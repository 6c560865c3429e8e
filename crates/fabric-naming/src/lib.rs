//! # fabric-naming
//!
//! The distributed mount-table tree and the recursive name resolver
//! (components D and E).
//!
//! ## Modules
//!
//! - [`acl`] — per-node tagged access control (Read, Resolve, Admin, Mount)
//! - [`mount_table`] — the in-memory mount-table tree: `Mount`, `Unmount`,
//!   `ResolveStep`, `Glob`
//! - [`resolver`] — recursive resolution across mount tables, loop
//!   detection, federated glob

pub mod acl;
pub mod mount_table;
pub mod resolver;

pub use acl::{Acl, AclTag};
pub use mount_table::{GlobEntry, MountFlags, MountTable, ResolveStepResult};
pub use resolver::{MountTableService, Resolver};

/// Errors raised by the naming subsystem.
#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    /// Resolution walked off the tree with no mount found, and the
    /// original name was non-empty.
    #[error("no such name: {0}")]
    NoSuchName(String),

    /// Resolution was attempted against an empty name.
    #[error("no such name root")]
    NoSuchNameRoot,

    /// A mount conflicted with an existing live mount's MT flag.
    #[error("mt flag mismatch at {0}")]
    MtFlagMismatch(String),

    /// An ACL mutation's expected version did not match the current one.
    #[error("bad version: expected {expected}, found {found}")]
    BadVersion {
        /// The version the caller expected.
        expected: u64,
        /// The version actually stored.
        found: u64,
    },

    /// An ancestor or the node itself denied the requested tag.
    #[error("access denied for tag {0:?}")]
    NoAccess(acl::AclTag),

    /// The resolver revisited an endpoint it had already visited in this
    /// call.
    #[error("naming loop detected at {0}")]
    NamingLoop(String),

    /// A name or endpoint embedded in a name failed to parse.
    #[error(transparent)]
    MalformedName(#[from] fabric_types::NameError),

    /// A mount-table call reached over the wire (`fabric-runtime`'s
    /// `RpcMountTableClient`) failed at the transport layer rather than at
    /// the mount table itself — the remote was unreachable, the handshake
    /// failed, or it reported an application error this client-side enum
    /// has no matching variant for.
    #[error("remote mount table call failed: {0}")]
    Remote(String),
}

impl fabric_types::IntoFabricError for NamingError {
    fn kind(&self) -> fabric_types::ErrorKind {
        use fabric_types::ErrorKind;
        match self {
            NamingError::NoSuchName(_) => ErrorKind::NoSuchName,
            NamingError::NoSuchNameRoot => ErrorKind::NoSuchNameRoot,
            NamingError::MtFlagMismatch(_) => ErrorKind::MtFlagMismatch,
            NamingError::BadVersion { .. } => ErrorKind::BadVersion,
            NamingError::NoAccess(_) => ErrorKind::NoAccess,
            NamingError::NamingLoop(_) => ErrorKind::NamingLoop,
            NamingError::MalformedName(_) => ErrorKind::MalformedName,
            NamingError::Remote(_) => ErrorKind::ConnectionFailed,
        }
    }
}

/// Convenience result type for the naming subsystem.
pub type Result<T> = std::result::Result<T, NamingError>;
