//! Certificate chains and the `Blessings` forest (§3, §4.B, §9).
//!
//! A chain is an ordered list of certificates `cert0 … certN`. `cert0` is
//! self-signed by some root key. `certI` (i>0) binds an extension string
//! plus a caveat list to the public key of `certI+1`, signed by `certI-1`'s
//! key. Every certificate's signed transcript folds in a digest of every
//! certificate before it, so altering any earlier certificate invalidates
//! every certificate after it — rebinding a chain onto a different prefix
//! is cryptographically impossible, not merely discouraged.

use fabric_crypto::blake3::{self, contexts};
use fabric_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::caveat::Caveat;
use crate::SecurityError;

/// One certificate in a chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Certificate {
    /// The extension this certificate adds to the chain's name.
    pub extension: String,
    /// Caveats restricting when the blessing extended by this certificate
    /// may be used.
    pub caveats: Vec<Caveat>,
    /// The public key this certificate binds its extension and caveats to
    /// (the "subject" of the certificate).
    pub subject_public_key: VerifyingKey,
    /// Signature over this certificate's fields plus a digest of every
    /// certificate before it in the chain, produced by the issuer (the
    /// previous certificate's subject key, or this same key for `cert0`).
    pub signature: Signature,
}

/// An ordered, non-empty list of certificates: `cert0` is self-signed;
/// certificate `i` is signed by certificate `i-1`'s subject key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateChain(Vec<Certificate>);

/// A forest of independently rooted certificate chains, all bound to the
/// same public key (the key of the last certificate in every chain).
///
/// Chains are never flattened into one: caveat scoping is per-chain, and
/// authorization unions the approved names of every chain that passes
/// validation independently.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Blessings(Vec<CertificateChain>);

fn prior_chain_digest(certs: &[Certificate]) -> [u8; 32] {
    let mut acc = blake3::hash(contexts::CERTIFICATE_SIGNATURE_DOMAIN.as_bytes());
    for cert in certs {
        let mut caveats_bytes = Vec::new();
        ciborium::into_writer(&cert.caveats, &mut caveats_bytes)
            .expect("caveat list is always encodable");
        let fields = blake3::encode_multi_field(&[
            &acc,
            cert.extension.as_bytes(),
            &caveats_bytes,
            cert.subject_public_key.as_bytes(),
            &cert.signature.to_bytes(),
        ]);
        acc = blake3::hash(&fields);
    }
    acc
}

fn signing_transcript(
    prior_certs: &[Certificate],
    extension: &str,
    caveats: &[Caveat],
    subject_public_key: &VerifyingKey,
) -> Vec<u8> {
    let prior_digest = prior_chain_digest(prior_certs);
    let mut caveats_bytes = Vec::new();
    ciborium::into_writer(caveats, &mut caveats_bytes).expect("caveat list is always encodable");
    blake3::encode_multi_field(&[
        contexts::CERTIFICATE_SIGNATURE_DOMAIN.as_bytes(),
        &prior_digest,
        extension.as_bytes(),
        &caveats_bytes,
        subject_public_key.as_bytes(),
    ])
}

impl CertificateChain {
    /// Mint a new root chain, self-signed by `signing_key`.
    pub fn self_signed(signing_key: &SigningKey, extension: impl Into<String>, caveats: Vec<Caveat>) -> Self {
        let extension = extension.into();
        let subject_public_key = signing_key.verifying_key();
        let transcript = signing_transcript(&[], &extension, &caveats, &subject_public_key);
        let signature = signing_key.sign(&transcript);
        CertificateChain(vec![Certificate {
            extension,
            caveats,
            subject_public_key,
            signature,
        }])
    }

    /// Extend this chain by one certificate, binding `subject_public_key` as
    /// the new last key. The caller must hold the private key corresponding
    /// to this chain's current [`bound_key`](Self::bound_key).
    #[must_use]
    pub fn extend(
        &self,
        issuer_signing_key: &SigningKey,
        subject_public_key: VerifyingKey,
        extension: impl Into<String>,
        caveats: Vec<Caveat>,
    ) -> crate::Result<Self> {
        if &issuer_signing_key.verifying_key() != self.bound_key() {
            return Err(SecurityError::PublicKeyMismatch);
        }
        let extension = extension.into();
        let transcript = signing_transcript(&self.0, &extension, &caveats, &subject_public_key);
        let signature = issuer_signing_key.sign(&transcript);
        let mut certs = self.0.clone();
        certs.push(Certificate {
            extension,
            caveats,
            subject_public_key,
            signature,
        });
        Ok(CertificateChain(certs))
    }

    /// The key this chain is currently bound to: the last certificate's
    /// subject key.
    pub fn bound_key(&self) -> &VerifyingKey {
        &self
            .0
            .last()
            .expect("CertificateChain is never empty")
            .subject_public_key
    }

    /// The chain's name: the dotted concatenation of every certificate's
    /// extension.
    pub fn name(&self) -> String {
        self.0
            .iter()
            .map(|c| c.extension.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// The certificates making up this chain, in order.
    pub fn certificates(&self) -> &[Certificate] {
        &self.0
    }

    /// Verify every signature in the chain. `cert0`'s signature is checked
    /// against its own subject key; every later certificate's signature is
    /// checked against the previous certificate's subject key, over a
    /// transcript that folds in everything before it.
    pub fn verify_signatures(&self) -> crate::Result<()> {
        for (i, cert) in self.0.iter().enumerate() {
            let prior = &self.0[..i];
            let issuer_key = if i == 0 {
                &cert.subject_public_key
            } else {
                &self.0[i - 1].subject_public_key
            };
            let transcript = signing_transcript(prior, &cert.extension, &cert.caveats, &cert.subject_public_key);
            issuer_key.verify(&transcript, &cert.signature).map_err(|_| {
                tracing::warn!(certificate_index = i, "certificate signature verification failed");
                SecurityError::AuthFailed(format!("certificate {i} signature invalid"))
            })?;
        }
        Ok(())
    }

    /// Evaluate every caveat on every certificate against `ctx`. The chain
    /// is approved iff every caveat on every certificate passes.
    pub fn approved(&self, ctx: &crate::caveat::CallContext<'_>) -> bool {
        self.0.iter().all(|cert| cert.caveats.iter().all(|c| c.validate(ctx)))
    }
}

impl Blessings {
    /// An empty blessings value (no chains).
    pub fn empty() -> Self {
        Blessings(Vec::new())
    }

    /// Wrap a single chain.
    pub fn from_chain(chain: CertificateChain) -> Self {
        Blessings(vec![chain])
    }

    /// Wrap several chains. Every chain must be bound to the same key, or
    /// this is a programmer error — callers construct blessings only from
    /// chains extended from a common root by this same process.
    pub fn from_chains(chains: Vec<CertificateChain>) -> Self {
        Blessings(chains)
    }

    /// Whether this value holds no chains.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The chains making up this forest.
    pub fn chains(&self) -> &[CertificateChain] {
        &self.0
    }

    /// The public key every chain is bound to, if this value holds at least
    /// one chain.
    pub fn bound_key(&self) -> Option<&VerifyingKey> {
        self.0.first().map(CertificateChain::bound_key)
    }

    /// Merge two blessings values into one forest (used by
    /// `BlessingStore::ForPeer` to union matching entries).
    pub fn union(mut self, other: Blessings) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Verify every chain's certificate signatures.
    pub fn verify_signatures(&self) -> crate::Result<()> {
        for chain in &self.0 {
            chain.verify_signatures()?;
        }
        Ok(())
    }

    /// The names of every chain that is both signature-valid and whose
    /// caveats all pass against `ctx`. Chains that fail signature
    /// verification or caveat evaluation contribute no names — this is the
    /// sole authorization-relevant output of a `Blessings` value.
    pub fn approved_names(&self, ctx: &crate::caveat::CallContext<'_>) -> Vec<String> {
        self.0
            .iter()
            .filter(|chain| chain.verify_signatures().is_ok() && chain.approved(ctx))
            .map(CertificateChain::name)
            .collect()
    }

    /// Canonical CBOR encoding, used for wire transfer and signed-file
    /// persistence.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| SecurityError::Persistence(format!("encode blessings: {e}")))?;
        Ok(out)
    }

    /// Decode a canonical CBOR encoding produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| SecurityError::Persistence(format!("decode blessings: {e}")))
    }
}
