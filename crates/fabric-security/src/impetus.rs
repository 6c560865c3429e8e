//! The discharge-cache fingerprint (§3, §9 resolved open question).
//!
//! An impetus records the server, method, and arguments a call is being
//! made with, because a discharger may choose to narrow a discharge to a
//! specific call. The fingerprint is:
//!
//! ```text
//! BLAKE3(domain-tag
//!     || server-blessing-names-sorted-joined-by-0x00 || 0x00
//!     || method || 0x00
//!     || arg-count-as-u32-LE
//!     || arg0 || 0x00 || arg1 || ...)
//! ```
//!
//! When the originating third-party caveat is marked non-confidential, the
//! method and arguments are zeroed out of the input before hashing (but the
//! domain tag and server names are always included), so confidential and
//! non-confidential calls to the same server never collide in the cache but
//! non-confidential calls to the same server always share one cache entry
//! regardless of method or arguments.

use fabric_crypto::blake3::{self, contexts};

/// The server, method, and arguments a discharge is being requested for.
pub struct Impetus<'a> {
    /// The server's blessing names, in any order; sorted internally.
    pub server_blessing_names: &'a [String],
    /// The method being invoked.
    pub method: &'a str,
    /// The method's argument bytes, in order.
    pub args: &'a [Vec<u8>],
    /// Whether the originating third-party caveat was marked
    /// non-confidential.
    pub non_confidential: bool,
}

/// Compute the impetus fingerprint used to key the discharge cache.
pub fn fingerprint(impetus: &Impetus<'_>) -> [u8; 32] {
    let mut names: Vec<&str> = impetus
        .server_blessing_names
        .iter()
        .map(String::as_str)
        .collect();
    names.sort_unstable();
    let names_joined = names.join("\0");

    let mut input = Vec::new();
    input.extend_from_slice(contexts::IMPETUS_FINGERPRINT_DOMAIN.as_bytes());
    input.extend_from_slice(names_joined.as_bytes());
    input.push(0u8);

    if impetus.non_confidential {
        // Method and arguments are excluded entirely; confidential and
        // non-confidential requests to the same server must never collide,
        // which the domain tag plus fixed zero-length-method marker below
        // guarantees since a real method name is never empty.
        input.push(0u8);
        input.extend_from_slice(&0u32.to_le_bytes());
    } else {
        input.extend_from_slice(impetus.method.as_bytes());
        input.push(0u8);
        input.extend_from_slice(&(impetus.args.len() as u32).to_le_bytes());
        for arg in impetus.args {
            input.extend_from_slice(arg);
            input.push(0u8);
        }
    }

    blake3::hash(&input)
}
