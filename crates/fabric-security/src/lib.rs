//! # fabric-security
//!
//! The cryptographic identity model (component B+C): principals, blessing
//! stores, blessing roots, certificate chains, caveats, and the discharge
//! cache.
//!
//! ## Modules
//!
//! - [`pattern`] — blessing pattern matching (`a.b.…`)
//! - [`blessings`] — certificate chains and the `Blessings` forest
//! - [`caveat`] — caveat types, the call context, and caveat evaluation
//! - [`impetus`] — the discharge-cache fingerprint (§3)
//! - [`discharge`] — discharges and the discharge cache
//! - [`store`] — `BlessingStore` and its immutable/fixed wrappers
//! - [`roots`] — `BlessingRoots`
//! - [`principal`] — the `Principal` trait and its in-process implementation
//! - [`persistence`] — file-backed credential directory (§4.L, §6)

pub mod blessings;
pub mod caveat;
pub mod discharge;
pub mod impetus;
pub mod pattern;
pub mod persistence;
pub mod principal;
pub mod roots;
pub mod store;

pub use blessings::{Blessings, Certificate, CertificateChain};
pub use caveat::{CallContext, Caveat};
pub use discharge::{Discharge, DischargeCache};
pub use pattern::BlessingPattern;
pub use persistence::CredentialsDir;
pub use principal::{LocalPrincipal, Principal};
pub use roots::BlessingRoots;
pub use store::{BlessingStore, FixedBlessingStore, ImmutableBlessingStore, InMemoryBlessingStore};

/// Errors raised by the security subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// `Bless` was asked to extend a `Blessings` value not bound to the
    /// target key.
    #[error("public key mismatch: blessings being extended are not bound to the target key")]
    PublicKeyMismatch,

    /// No registered root recognizes the presented blessing name.
    #[error("unrecognized root for blessing name {0:?}")]
    UnrecognizedRoot(String),

    /// A caveat carries an unknown id, or malformed parameters for a known
    /// one.
    #[error("invalid caveat: {0}")]
    InvalidCaveat(String),

    /// A mutating call landed on an immutable wrapper.
    #[error("store is immutable")]
    ImmutableStore,

    /// Signature verification failed while validating a certificate chain
    /// or a discharge.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A file-backed principal's on-disk state failed to load (bad
    /// signature, corrupt encoding, wrong passphrase).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Wraps a lower-level cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] fabric_crypto::CryptoError),
}

impl fabric_types::IntoFabricError for SecurityError {
    fn kind(&self) -> fabric_types::ErrorKind {
        use fabric_types::ErrorKind;
        match self {
            SecurityError::PublicKeyMismatch => ErrorKind::PublicKeyMismatch,
            SecurityError::UnrecognizedRoot(_) => ErrorKind::UnrecognizedRoot,
            SecurityError::InvalidCaveat(_) => ErrorKind::InvalidCaveat,
            SecurityError::ImmutableStore => ErrorKind::ImmutableStore,
            SecurityError::AuthFailed(_) => ErrorKind::AuthFailed,
            SecurityError::Persistence(_) => ErrorKind::Internal,
            SecurityError::Crypto(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience result type for the security subsystem.
pub type Result<T> = std::result::Result<T, SecurityError>;
