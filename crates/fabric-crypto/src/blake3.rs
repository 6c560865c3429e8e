//! Domain-separated BLAKE3 hashing.
//!
//! BLAKE3 serves several distinct purposes across the fabric. Cross-domain
//! collisions are prevented by mandatory domain separation using BLAKE3's
//! built-in mode flags, never by ad-hoc prefixing.
//!
//! ## Modes
//!
//! - [`hash`] — Pure hashing: the impetus fingerprint, Merkle-style digests
//! - [`derive_key`] — Key derivation: principal-file encryption keys
//! - [`keyed_hash`] — Keyed MAC/PRF: certificate and discharge signing
//!   transcripts that need a fixed-width domain-bound digest before signing
//!
//! ## Context strings
//!
//! Every registered context string is listed in [`contexts`]. Using an
//! unregistered context string is a bug, not a runtime error: callers always
//! reference the constant, never a literal.

/// Registered BLAKE3 context strings.
pub mod contexts {
    /// Domain tag mixed into every certificate's signed transcript, binding
    /// a certificate signature to this system and preventing cross-protocol
    /// signature reuse.
    pub const CERTIFICATE_SIGNATURE_DOMAIN: &str = "fabric v1 certificate-signature-domain";

    /// Domain tag mixed into a discharge's signed transcript.
    pub const DISCHARGE_SIGNATURE_DOMAIN: &str = "fabric v1 discharge-signature-domain";

    /// Domain tag prefixed to every impetus fingerprint computation (§3).
    pub const IMPETUS_FINGERPRINT_DOMAIN: &str = "fabric v1 impetus-fingerprint-domain";

    /// Key-derivation context for deriving a principal's private-key-at-rest
    /// encryption key from an Argon2id-stretched passphrase.
    pub const PRINCIPAL_FILE_ENCRYPTION_KEY: &str = "fabric v1 principal-file-encryption-key";

    /// Key-derivation context for the MAC key protecting a blessing store or
    /// blessing roots file against tampering by anything other than the
    /// principal that owns it.
    pub const BLESSING_FILE_SIGNATURE_KEY: &str = "fabric v1 blessing-file-signature-key";

    /// Key-derivation context for deriving per-flow transport encryption
    /// keys once a handshake has agreed a shared secret.
    pub const FLOW_SESSION_KEY: &str = "fabric v1 flow-session-key";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        CERTIFICATE_SIGNATURE_DOMAIN,
        DISCHARGE_SIGNATURE_DOMAIN,
        IMPETUS_FINGERPRINT_DOMAIN,
        PRINCIPAL_FILE_ENCRYPTION_KEY,
        BLESSING_FILE_SIGNATURE_KEY,
        FLOW_SESSION_KEY,
    ];
}

/// Compute a BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Compute a variable-length BLAKE3 hash.
pub fn hash_xof(data: &[u8], output: &mut [u8]) {
    let mut hasher = ::blake3::Hasher::new();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// `context` must be one of the strings in [`contexts::ALL_CONTEXTS`].
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    let h = hasher.finalize();
    out.copy_from_slice(h.as_bytes());
    out
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
///
/// The key must be exactly 32 bytes, typically derived via [`derive_key`].
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Whether a context string is registered.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

/// Encode multiple dynamic fields with length-prefixed encoding, so that
/// concatenating variable-length fields cannot alias across a field
/// boundary. Used to build the impetus fingerprint transcript (§3):
/// `LE32(len(field)) || field` repeated for each field.
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_context_strings_registered() {
        for ctx in contexts::ALL_CONTEXTS {
            assert!(
                ctx.starts_with("fabric v1 "),
                "context string '{ctx}' has wrong prefix"
            );
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let result1 = hash(b"fabric test vector 1");
        let result2 = hash(b"fabric test vector 1");
        assert_eq!(result1, result2);
    }

    #[test]
    fn test_hash_different_inputs() {
        let result1 = hash(b"input1");
        let result2 = hash(b"input2");
        assert_ne!(result1, result2);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let key1 = derive_key(contexts::PRINCIPAL_FILE_ENCRYPTION_KEY, &[0u8; 32]);
        let key2 = derive_key(contexts::PRINCIPAL_FILE_ENCRYPTION_KEY, &[0u8; 32]);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_derive_key_different_contexts() {
        let key1 = derive_key(contexts::PRINCIPAL_FILE_ENCRYPTION_KEY, &[0u8; 32]);
        let key2 = derive_key(contexts::FLOW_SESSION_KEY, &[0u8; 32]);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_keyed_hash_deterministic() {
        let key = derive_key(contexts::CERTIFICATE_SIGNATURE_DOMAIN, b"");
        let mac1 = keyed_hash(&key, &[0u8; 64]);
        let mac2 = keyed_hash(&key, &[0u8; 64]);
        assert_eq!(mac1, mac2);
    }

    #[test]
    fn test_multi_field_encoding() {
        let encoded = encode_multi_field(&[b"hello", b"world"]);
        assert_eq!(encoded.len(), 4 + 5 + 4 + 5);
        assert_eq!(&encoded[0..4], &5u32.to_le_bytes());
        assert_eq!(&encoded[4..9], b"hello");
        assert_eq!(&encoded[9..13], &5u32.to_le_bytes());
        assert_eq!(&encoded[13..18], b"world");
    }

    #[test]
    fn test_multi_field_no_aliasing_across_boundary() {
        // "ab" + "c" must hash differently from "a" + "bc": the length
        // prefixes prevent naive concatenation from aliasing.
        let a = encode_multi_field(&[b"ab", b"c"]);
        let b = encode_multi_field(&[b"a", b"bc"]);
        assert_ne!(hash(&a), hash(&b));
    }

    #[test]
    fn test_is_registered_context() {
        assert!(is_registered_context(
            contexts::PRINCIPAL_FILE_ENCRYPTION_KEY
        ));
        assert!(!is_registered_context("fabric v1 made-up-context"));
    }

    #[test]
    fn test_xof_output() {
        let mut output64 = [0u8; 64];
        hash_xof(b"test", &mut output64);
        let standard = hash(b"test");
        assert_eq!(&output64[..32], &standard);
    }
}
