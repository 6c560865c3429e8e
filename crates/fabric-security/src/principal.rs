//! The `Principal` abstraction (§3, §4.B, §4.H).
//!
//! A principal owns a private signing key, a blessing store, and a trusted
//! root set. This trait is implemented both by an in-process key holder and
//! by the agent-backed client in `fabric-agent`, so that the rest of the
//! codebase threads a `&dyn Principal` without caring which.

use fabric_crypto::ed25519::{SigningKey, VerifyingKey};

use crate::blessings::{Blessings, CertificateChain};
use crate::caveat::Caveat;
use crate::roots::BlessingRoots;
use crate::store::BlessingStore;
use crate::SecurityError;

/// The operations every principal supports, local or agent-backed.
pub trait Principal: Send + Sync {
    /// This principal's public key.
    fn public_key(&self) -> VerifyingKey;

    /// Sign arbitrary bytes with this principal's private key. Used
    /// directly by the authentication handshake (§4.G) to sign the channel
    /// binding transcript.
    fn sign(&self, message: &[u8]) -> fabric_crypto::ed25519::Signature;

    /// Mint a new self-signed root chain under this principal's key.
    fn bless_self(&self, name: &str, caveats: Vec<Caveat>) -> Blessings;

    /// Extend every chain of `with` by one certificate binding `target_key`,
    /// signed by this principal's key. Fails with
    /// [`SecurityError::PublicKeyMismatch`] if `with` is not bound to this
    /// principal's key.
    fn bless(
        &self,
        target_key: VerifyingKey,
        with: &Blessings,
        extension: &str,
        caveat: Caveat,
        extra_caveats: Vec<Caveat>,
    ) -> crate::Result<Blessings>;

    /// This principal's blessing store.
    fn blessing_store(&self) -> &dyn BlessingStore;

    /// This principal's trusted root set.
    fn roots(&self) -> &BlessingRoots;
}

/// A principal whose private key lives in this process's memory.
pub struct LocalPrincipal<S> {
    signing_key: SigningKey,
    store: S,
    roots: BlessingRoots,
}

impl<S: BlessingStore> LocalPrincipal<S> {
    /// Wrap a signing key with a blessing store and an empty root set.
    pub fn new(signing_key: SigningKey, store: S) -> Self {
        Self {
            signing_key,
            store,
            roots: BlessingRoots::new(),
        }
    }

    /// Wrap a signing key with a blessing store and a pre-populated root
    /// set (e.g. loaded from a persisted `blessingroots.data` file).
    pub fn with_roots(signing_key: SigningKey, store: S, roots: BlessingRoots) -> Self {
        Self {
            signing_key,
            store,
            roots,
        }
    }

    /// Generate a fresh principal with a random key and an in-memory store.
    pub fn generate() -> LocalPrincipal<crate::store::InMemoryBlessingStore> {
        LocalPrincipal::new(
            fabric_crypto::ed25519::SigningKey::generate(),
            crate::store::InMemoryBlessingStore::new(),
        )
    }
}

impl<S: BlessingStore> Principal for LocalPrincipal<S> {
    fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn sign(&self, message: &[u8]) -> fabric_crypto::ed25519::Signature {
        self.signing_key.sign(message)
    }

    fn bless_self(&self, name: &str, caveats: Vec<Caveat>) -> Blessings {
        Blessings::from_chain(CertificateChain::self_signed(&self.signing_key, name, caveats))
    }

    fn bless(
        &self,
        target_key: VerifyingKey,
        with: &Blessings,
        extension: &str,
        caveat: Caveat,
        extra_caveats: Vec<Caveat>,
    ) -> crate::Result<Blessings> {
        let mut caveats = vec![caveat];
        caveats.extend(extra_caveats);
        let mut extended_chains = Vec::with_capacity(with.chains().len());
        for chain in with.chains() {
            if chain.bound_key() != &self.public_key() {
                return Err(SecurityError::PublicKeyMismatch);
            }
            extended_chains.push(chain.extend(
                &self.signing_key,
                target_key.clone(),
                extension,
                caveats.clone(),
            )?);
        }
        Ok(Blessings::from_chains(extended_chains))
    }

    fn blessing_store(&self) -> &dyn BlessingStore {
        &self.store
    }

    fn roots(&self) -> &BlessingRoots {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBlessingStore;

    #[test]
    fn bless_self_mints_root_chain() {
        let p = LocalPrincipal::new(SigningKey::generate(), InMemoryBlessingStore::new());
        let b = p.bless_self("alice", vec![]);
        assert_eq!(b.chains()[0].name(), "alice");
        assert_eq!(b.bound_key(), Some(&p.public_key()));
    }

    #[test]
    fn bless_extends_and_rejects_mismatched_key() {
        let alice = LocalPrincipal::new(SigningKey::generate(), InMemoryBlessingStore::new());
        let bob_key = SigningKey::generate();
        let bob_public = bob_key.verifying_key();

        let alice_blessing = alice.bless_self("alice", vec![]);
        let extended = alice
            .bless(bob_public.clone(), &alice_blessing, "friend", Caveat::Expiry { not_after: u64::MAX }, vec![])
            .expect("bless");
        assert_eq!(extended.chains()[0].name(), "alice.friend");
        assert_eq!(extended.bound_key(), Some(&bob_public));

        // Blessing a chain not bound to alice's key must fail.
        let mallory = LocalPrincipal::new(SigningKey::generate(), InMemoryBlessingStore::new());
        let mallory_blessing = mallory.bless_self("mallory", vec![]);
        let err = alice.bless(bob_public, &mallory_blessing, "friend", Caveat::Expiry { not_after: 0 }, vec![]);
        assert!(matches!(err, Err(SecurityError::PublicKeyMismatch)));
    }
}
