//! Argon2id passphrase-based key derivation.
//!
//! Used exclusively to derive the ChaCha20-Poly1305 key that wraps a
//! file-backed principal's private key at rest (§4.L). The parameters below
//! match the interactive-use recommendation in RFC 9106 §4: comfortably
//! expensive for an attacker brute-forcing a stolen credentials directory,
//! cheap enough not to be noticed on every process start.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::{CryptoError, Result};

/// Memory cost in KiB (64 MiB).
pub const PRINCIPAL_M_COST: u32 = 65536;
/// Time cost (iterations).
pub const PRINCIPAL_T_COST: u32 = 3;
/// Parallelism (lanes).
pub const PRINCIPAL_P_COST: u32 = 4;
/// Derived key length in bytes.
pub const PRINCIPAL_OUTPUT_LEN: usize = 32;

/// Derive the private-key-at-rest encryption key from a passphrase and salt,
/// using the fixed parameters above.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; PRINCIPAL_OUTPUT_LEN]> {
    let params = Params::new(
        PRINCIPAL_M_COST,
        PRINCIPAL_T_COST,
        PRINCIPAL_P_COST,
        Some(PRINCIPAL_OUTPUT_LEN),
    )
    .map_err(|e| CryptoError::Argon2(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; PRINCIPAL_OUTPUT_LEN];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::Argon2(e.to_string()))?;

    Ok(output)
}

/// Generate a random 16-byte salt.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{Algorithm as TestAlgorithm, Params as TestParams, Version as TestVersion};

    // Small parameters for fast tests; production code always goes through
    // derive_key with the fixed constants above.
    fn derive_with(passphrase: &[u8], salt: &[u8]) -> [u8; 32] {
        let params = TestParams::new(1024, 1, 1, Some(32)).expect("params");
        let argon2 = Argon2::new(TestAlgorithm::Argon2id, TestVersion::V0x13, params);
        let mut out = [0u8; 32];
        argon2
            .hash_password_into(passphrase, salt, &mut out)
            .expect("derive");
        out
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = b"1234567890123456";
        let key1 = derive_with(b"test passphrase", salt);
        let key2 = derive_with(b"test passphrase", salt);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_derive_key_different_passphrases() {
        let salt = b"1234567890123456";
        let key1 = derive_with(b"pass1", salt);
        let key2 = derive_with(b"pass2", salt);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_derive_key_different_salts() {
        let passphrase = b"passphrase";
        let key1 = derive_with(passphrase, b"salt111111111111");
        let key2 = derive_with(passphrase, b"salt222222222222");
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_generate_salt() {
        let salt1 = generate_salt();
        let salt2 = generate_salt();
        assert_ne!(salt1, salt2);
        assert_eq!(salt1.len(), 16);
    }

    #[test]
    fn test_real_params_produce_output() {
        // Exercises the real derive_key path once with the production
        // parameters to catch a misconfigured Params::new at its call site.
        let salt = generate_salt();
        let key = derive_key(b"correct horse battery staple", &salt).expect("derive");
        assert_eq!(key.len(), PRINCIPAL_OUTPUT_LEN);
    }
}
