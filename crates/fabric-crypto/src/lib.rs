//! # fabric-crypto
//!
//! Cryptographic primitives for the fabric core. No algorithm negotiation is
//! permitted — the suite is fixed, matching the rest of the workspace's
//! "no negotiation, one correct way" posture.
//!
//! ## Modules
//!
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032); the sole
//!   signature algorithm for principal keys, certificates, and discharges.
//! - [`blake3`] — Domain-separated BLAKE3 hashing: certificate signature
//!   domains, the discharge impetus fingerprint, and key derivation.
//! - [`chacha20`] — ChaCha20-Poly1305 AEAD, used to encrypt a file-backed
//!   principal's private key at rest.
//! - [`argon2id`] — Passphrase-based key derivation for the same at-rest
//!   encryption.

pub mod argon2id;
pub mod blake3;
pub mod chacha20;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD encryption or decryption failed (authentication tag mismatch).
    #[error("AEAD operation failed")]
    AeadDecryption,

    /// Argon2id key derivation failed.
    #[error("argon2id error: {0}")]
    Argon2(String),

    /// Invalid key or signature length or encoding.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl fabric_types::IntoFabricError for CryptoError {
    fn kind(&self) -> fabric_types::ErrorKind {
        match self {
            // Crypto failures surface as auth-failed at the handshake layer;
            // callers that need a finer grain match on CryptoError directly.
            CryptoError::SignatureVerification => fabric_types::ErrorKind::AuthFailed,
            CryptoError::AeadDecryption => fabric_types::ErrorKind::Internal,
            CryptoError::Argon2(_) => fabric_types::ErrorKind::Internal,
            CryptoError::InvalidInput(_) => fabric_types::ErrorKind::Internal,
        }
    }
}

/// Convenience result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
