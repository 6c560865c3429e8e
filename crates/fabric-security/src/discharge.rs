//! Discharges and the discharge cache (§3, §4.C).

use std::collections::HashMap;
use std::sync::Mutex;

use fabric_crypto::blake3::contexts;
use fabric_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::caveat::Caveat;
use crate::SecurityError;

/// A signed assertion from a third-party discharger that its caveat is
/// currently satisfied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Discharge {
    /// Identifies the third-party caveat this discharge satisfies.
    pub third_party_id: [u8; 32],
    /// Caveats the discharger has embedded in this discharge (typically an
    /// expiry, possibly narrowed from the caveat's `requested_caveats`).
    pub caveats: Vec<Caveat>,
    /// The discharger's signature over `(third_party_id, caveats)`.
    pub signature: Signature,
}

fn signing_transcript(third_party_id: &[u8; 32], caveats: &[Caveat]) -> Vec<u8> {
    let mut caveats_bytes = Vec::new();
    ciborium::into_writer(caveats, &mut caveats_bytes).expect("caveat list is always encodable");
    fabric_crypto::blake3::encode_multi_field(&[
        contexts::DISCHARGE_SIGNATURE_DOMAIN.as_bytes(),
        third_party_id,
        &caveats_bytes,
    ])
}

impl Discharge {
    /// Mint a new discharge, signed by the discharger's key.
    pub fn mint(discharger_key: &SigningKey, third_party_id: [u8; 32], caveats: Vec<Caveat>) -> Self {
        let transcript = signing_transcript(&third_party_id, &caveats);
        let signature = discharger_key.sign(&transcript);
        Discharge {
            third_party_id,
            caveats,
            signature,
        }
    }

    /// The exact bytes a discharger must sign to mint a discharge for
    /// `third_party_id` over `caveats`. Exposed so a [`crate::Principal`]
    /// implementation (local or agent-backed, which only exposes a generic
    /// `sign(bytes)`, not its raw [`SigningKey`]) can mint discharges too.
    pub fn signing_transcript(third_party_id: [u8; 32], caveats: &[Caveat]) -> Vec<u8> {
        signing_transcript(&third_party_id, caveats)
    }

    /// Assemble a discharge from a signature already produced over
    /// [`Discharge::signing_transcript`]'s output.
    pub fn from_signature(third_party_id: [u8; 32], caveats: Vec<Caveat>, signature: Signature) -> Self {
        Discharge { third_party_id, caveats, signature }
    }

    /// Verify that this discharge was signed by the given discharger key.
    pub fn verify_signature(&self, discharger_public_key: &VerifyingKey) -> crate::Result<()> {
        let transcript = signing_transcript(&self.third_party_id, &self.caveats);
        discharger_public_key
            .verify(&transcript, &self.signature)
            .map_err(|_| SecurityError::AuthFailed("discharge signature invalid".to_string()))
    }
}

/// Caches discharges keyed by `(third-party-id, impetus-fingerprint)`.
///
/// Entries are evicted lazily: a lookup that finds an entry whose embedded
/// expiry caveat has passed is treated as a miss and removed. `CacheDischarge`
/// is a no-op for non-cacheable discharges — callers that know a caveat is
/// non-confidential pass a fixed fingerprint (see [`crate::impetus`]) so the
/// entry is naturally shared, and the cache itself imposes no further
/// restriction.
#[derive(Default)]
pub struct DischargeCache {
    entries: Mutex<HashMap<([u8; 32], [u8; 32]), Discharge>>,
}

impl DischargeCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached discharge, evicting it first if its embedded expiry
    /// has passed.
    pub fn get(&self, third_party_id: [u8; 32], impetus_fingerprint: [u8; 32], now: u64) -> Option<Discharge> {
        let key = (third_party_id, impetus_fingerprint);
        let mut entries = self.entries.lock().expect("discharge cache mutex poisoned");
        if let Some(d) = entries.get(&key) {
            if discharge_expired(d, now) {
                tracing::debug!(third_party_id = hex::encode(third_party_id), "evicting expired discharge");
                entries.remove(&key);
                return None;
            }
            return Some(d.clone());
        }
        None
    }

    /// Insert a freshly fetched discharge into the cache.
    pub fn insert(&self, impetus_fingerprint: [u8; 32], discharge: Discharge) {
        let key = (discharge.third_party_id, impetus_fingerprint);
        self.entries
            .lock()
            .expect("discharge cache mutex poisoned")
            .insert(key, discharge);
    }

    /// Remove every cached discharge, e.g. in response to `ClearDischarges`.
    pub fn clear(&self) {
        self.entries.lock().expect("discharge cache mutex poisoned").clear();
    }
}

fn discharge_expired(discharge: &Discharge, now: u64) -> bool {
    discharge.caveats.iter().any(|c| match c {
        Caveat::Expiry { not_after } => now > *not_after,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_verify_roundtrip() {
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        let d = Discharge::mint(&kp.signing_key, [1u8; 32], vec![Caveat::Expiry { not_after: 100 }]);
        assert!(d.verify_signature(&kp.verifying_key).is_ok());
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let kp1 = fabric_crypto::ed25519::KeyPair::generate();
        let kp2 = fabric_crypto::ed25519::KeyPair::generate();
        let d = Discharge::mint(&kp1.signing_key, [1u8; 32], vec![]);
        assert!(d.verify_signature(&kp2.verifying_key).is_err());
    }

    #[test]
    fn verify_fails_when_tampered() {
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        let mut d = Discharge::mint(&kp.signing_key, [1u8; 32], vec![Caveat::Expiry { not_after: 100 }]);
        d.caveats = vec![Caveat::Expiry { not_after: 999_999 }];
        assert!(d.verify_signature(&kp.verifying_key).is_err());
    }

    #[test]
    fn cache_evicts_expired_entries_on_get() {
        let cache = DischargeCache::new();
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        let d = Discharge::mint(&kp.signing_key, [2u8; 32], vec![Caveat::Expiry { not_after: 50 }]);
        cache.insert([7u8; 32], d);
        assert!(cache.get([2u8; 32], [7u8; 32], 10).is_some());
        assert!(cache.get([2u8; 32], [7u8; 32], 100).is_none());
    }

    #[test]
    fn clear_removes_all_entries() {
        let cache = DischargeCache::new();
        let kp = fabric_crypto::ed25519::KeyPair::generate();
        let d = Discharge::mint(&kp.signing_key, [3u8; 32], vec![]);
        cache.insert([8u8; 32], d);
        cache.clear();
        assert!(cache.get([3u8; 32], [8u8; 32], 0).is_none());
    }
}
