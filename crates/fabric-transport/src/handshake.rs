//! The mutual blessing handshake (§4.G).
//!
//! Runs once per circuit, on the first flow it opens. TLS has already given
//! the circuit transport encryption; this handshake is what actually
//! authenticates the two ends to each other.
//!
//! The two sides are not symmetric in when they move: the
//! [`Role::Acceptor`] (normally the dialed server) presents its blessings
//! immediately, independent of anything the other side does. The
//! [`Role::Initiator`] (normally the dialer) waits for that offer, validates
//! it, and only then selects its own blessings with
//! `BlessingStore::for_peer` before presenting them. Both sides then sign a
//! transcript binding both nonces and a session id together, and exchange
//! those signatures as proof each actually holds the private key behind the
//! blessings it presented.
//!
//! The session id is chosen by the acceptor and carried inside its `Offer`,
//! rather than derived from the QUIC/TLS layer: a circuit's two hops can
//! differ when a proxy relay sits in the middle (§4.F), and Quinn's public
//! API does not expose TLS exporter keying material to derive a literal
//! channel binding from anyway. A value that travels end-to-end inside the
//! flow itself, instead of being recomputed per hop from transport state,
//! gives both sides the same value regardless of how many relays forwarded
//! the bytes in between.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;

use fabric_crypto::ed25519::VerifyingKey;
use fabric_security::caveat::CallContext;
use fabric_security::discharge::Discharge;
use fabric_security::impetus::{self, Impetus};
use fabric_security::{Blessings, Caveat, Principal};

use crate::flow::Flow;
use crate::messages::HandshakeFrame;
use crate::{Result, TransportError};

/// Which side of the handshake this call site is playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Presents its blessings first, without waiting on the peer.
    Acceptor,
    /// Waits for the peer's offer, then narrows its own presentation to it.
    Initiator,
}

/// Fetches a discharge for a third-party caveat from its discharger.
///
/// Implementations live in `fabric-runtime`, which can actually dial the
/// discharger by name using this crate's own [`crate::dial::Dialer`] and
/// invoke its discharge-minting method. This crate only depends on the
/// trait, to avoid a dependency cycle between dialing and handshaking.
#[async_trait]
pub trait DischargeFetcher: Send + Sync {
    /// Fetch (or mint) a discharge for the third-party caveat identified by
    /// `third_party_id`, reachable at `discharger_location`.
    async fn fetch(
        &self,
        third_party_id: [u8; 32],
        discharger_location: &str,
        requested_caveats: &[Caveat],
    ) -> Result<Discharge>;
}

/// A discharge fetcher that never succeeds. Appropriate for principals that
/// present no third-party-caveated blessings, and for tests.
pub struct NoDischargeFetcher;

#[async_trait]
impl DischargeFetcher for NoDischargeFetcher {
    async fn fetch(
        &self,
        _third_party_id: [u8; 32],
        discharger_location: &str,
        _requested_caveats: &[Caveat],
    ) -> Result<Discharge> {
        Err(TransportError::AuthFailed(format!(
            "no discharge fetcher configured; cannot reach discharger at {discharger_location}"
        )))
    }
}

/// What a completed handshake establishes.
pub struct HandshakeOutcome {
    /// The peer's public key, proven by its `Confirm` signature.
    pub peer_public_key: VerifyingKey,
    /// The blessings the peer presented, already signature- and
    /// root-verified. Caveats are re-evaluated per call against the actual
    /// method and arguments; only the root and signature checks are final
    /// here.
    pub peer_blessings: Blessings,
    /// Discharges the peer presented alongside its blessings, keyed by
    /// third-party id, for use evaluating `ThirdParty` caveats per call.
    pub peer_discharges: HashMap<[u8; 32], Discharge>,
    /// The blessings this side ended up presenting to the peer.
    pub local_blessings_presented: Blessings,
}

impl HandshakeOutcome {
    /// The peer's approved names for a specific call: every chain that is
    /// both signature-valid, root-recognized (already guaranteed at
    /// handshake time), and whose caveats pass against the given method and
    /// arguments right now.
    pub fn peer_approved_names_for(
        &self,
        method: &str,
        args: &[Vec<u8>],
        now: u64,
        local_approved_names: &[String],
    ) -> Vec<String> {
        let ctx = CallContext {
            local_endpoint: None,
            remote_endpoint: None,
            method,
            args,
            now,
            peer_approved_names: local_approved_names,
            discharges: &self.peer_discharges,
        };
        self.peer_blessings.approved_names(&ctx)
    }
}

/// Run the handshake over `flow`, which must be a freshly opened or
/// accepted flow carrying no other traffic.
pub async fn run(
    flow: &mut Flow,
    role: Role,
    principal: &dyn Principal,
    discharge_fetcher: &dyn DischargeFetcher,
    now: u64,
) -> Result<HandshakeOutcome> {
    let local_nonce = random_nonce();

    let (local_blessings, local_names, acceptor_session_id) = match role {
        Role::Acceptor => {
            let session_id = random_nonce();
            let blessings = principal.blessing_store().default_blessings();
            let names = approved_names_for_self(&blessings, now);
            send_offer(flow, &blessings, principal, discharge_fetcher, now, local_nonce, session_id).await?;
            (blessings, names, Some(session_id))
        }
        Role::Initiator => (Blessings::empty(), Vec::new(), None),
    };

    let (peer_blessings_raw, peer_discharges, peer_nonce, offer_session_id) = recv_offer(flow).await?;
    let session_id = acceptor_session_id.unwrap_or(offer_session_id);

    verify_root_recognition(principal, &peer_blessings_raw)?;
    let peer_ctx_names = approved_names_with_peer(&peer_blessings_raw, &peer_discharges, now, &local_names);
    if peer_ctx_names.is_empty() && !peer_blessings_raw.is_empty() {
        return Err(TransportError::AuthFailed(
            "peer presented no chain that both verifies and passes its caveats".to_string(),
        ));
    }

    let local_blessings = match role {
        Role::Acceptor => local_blessings,
        Role::Initiator => {
            let blessings = principal.blessing_store().for_peer(&peer_ctx_names);
            send_offer(flow, &blessings, principal, discharge_fetcher, now, local_nonce, session_id).await?;
            blessings
        }
    };

    let transcript_local = transcript(local_nonce, &session_id, peer_nonce);
    let signature = principal.sign(&transcript_local);
    flow.send_frame(&HandshakeFrame::Confirm { signature: signature.to_bytes().to_vec() })
        .await?;

    let peer_public_key = peer_blessings_raw
        .bound_key()
        .cloned()
        .ok_or_else(|| TransportError::AuthFailed("peer presented an empty blessings forest".to_string()))?;

    let peer_confirm: HandshakeFrame = flow.recv_frame().await?;
    let peer_signature_bytes = match peer_confirm {
        HandshakeFrame::Confirm { signature } => signature,
        HandshakeFrame::Reject { reason } => {
            return Err(TransportError::AuthFailed(format!("peer rejected handshake: {reason}")))
        }
        HandshakeFrame::Offer { .. } => {
            return Err(TransportError::Protocol("expected Confirm, got a second Offer".to_string()))
        }
    };
    let peer_signature_array: [u8; 64] = peer_signature_bytes
        .try_into()
        .map_err(|_| TransportError::AuthFailed("malformed peer confirm signature".to_string()))?;
    let peer_signature = fabric_crypto::ed25519::Signature::from_bytes(&peer_signature_array);
    let transcript_peer = transcript(peer_nonce, &session_id, local_nonce);
    peer_public_key
        .verify(&transcript_peer, &peer_signature)
        .map_err(|_| TransportError::AuthFailed("peer confirm signature does not match transcript".to_string()))?;

    Ok(HandshakeOutcome {
        peer_public_key,
        peer_blessings: peer_blessings_raw,
        peer_discharges,
        local_blessings_presented: local_blessings,
    })
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn transcript(nonce_local: [u8; 32], session_id: &[u8; 32], nonce_remote: [u8; 32]) -> Vec<u8> {
    fabric_crypto::blake3::encode_multi_field(&[
        fabric_crypto::blake3::contexts::FLOW_SESSION_KEY.as_bytes(),
        &nonce_local,
        session_id,
        &nonce_remote,
    ])
}

fn identity_ctx<'a>(now: u64, discharges: &'a HashMap<[u8; 32], Discharge>, peer_approved: &'a [String]) -> CallContext<'a> {
    CallContext {
        local_endpoint: None,
        remote_endpoint: None,
        method: "",
        args: &[],
        now,
        peer_approved_names: peer_approved,
        discharges,
    }
}

fn approved_names_for_self(blessings: &Blessings, now: u64) -> Vec<String> {
    let empty_discharges = HashMap::new();
    let ctx = identity_ctx(now, &empty_discharges, &[]);
    blessings.approved_names(&ctx)
}

fn approved_names_with_peer(
    blessings: &Blessings,
    discharges: &HashMap<[u8; 32], Discharge>,
    now: u64,
    peer_approved: &[String],
) -> Vec<String> {
    let ctx = identity_ctx(now, discharges, peer_approved);
    blessings.approved_names(&ctx)
}

fn verify_root_recognition(principal: &dyn Principal, blessings: &Blessings) -> Result<()> {
    if blessings.is_empty() {
        return Ok(());
    }
    let roots = principal.roots();
    let recognized = blessings.chains().iter().any(|chain| {
        let name = chain.name();
        let root_key = &chain.certificates()[0].subject_public_key;
        roots.recognized(root_key, &name)
    });
    if !recognized {
        return Err(TransportError::AuthFailed("no presented chain has a recognized root".to_string()));
    }
    Ok(())
}

async fn send_offer(
    flow: &mut Flow,
    blessings: &Blessings,
    principal: &dyn Principal,
    discharge_fetcher: &dyn DischargeFetcher,
    now: u64,
    nonce: [u8; 32],
    session_id: [u8; 32],
) -> Result<()> {
    let discharges = fetch_missing_discharges(blessings, principal.blessing_store().discharge_cache(), discharge_fetcher, now).await?;
    let encoded_blessings = blessings
        .encode()
        .map_err(|e| TransportError::Internal(format!("encode blessings: {e}")))?;
    let discharge_list: Vec<Discharge> = discharges.into_values().collect();
    let encoded_discharges = crate::messages::encode(&discharge_list)?;
    flow.send_frame(&HandshakeFrame::Offer {
        blessings: encoded_blessings,
        discharges: encoded_discharges,
        nonce,
        session_id,
    })
    .await
}

async fn recv_offer(flow: &mut Flow) -> Result<(Blessings, HashMap<[u8; 32], Discharge>, [u8; 32], [u8; 32])> {
    let frame: HandshakeFrame = flow.recv_frame().await?;
    match frame {
        HandshakeFrame::Offer { blessings, discharges, nonce, session_id } => {
            let blessings = Blessings::decode(&blessings)
                .map_err(|e| TransportError::Protocol(format!("decode peer blessings: {e}")))?;
            blessings
                .verify_signatures()
                .map_err(|e| TransportError::AuthFailed(format!("peer blessings signature check failed: {e}")))?;
            let discharge_list: Vec<Discharge> = crate::messages::decode(&discharges)?;
            let map = discharge_list.into_iter().map(|d| (d.third_party_id, d)).collect();
            Ok((blessings, map, nonce, session_id))
        }
        HandshakeFrame::Reject { reason } => Err(TransportError::AuthFailed(format!("peer rejected handshake: {reason}"))),
        HandshakeFrame::Confirm { .. } => Err(TransportError::Protocol("expected Offer, got Confirm".to_string())),
    }
}

/// Walk every certificate's caveats in `blessings`, serving a discharge for
/// each `ThirdParty` caveat from `cache` when a live entry is on hand and
/// fetching (then caching) one otherwise, and return the full set needed to
/// present alongside those blessings. The handshake itself has no method or
/// arguments yet to fold into the impetus, so every fingerprint computed
/// here has an empty method/args component, narrowed further only for
/// caveats marked non-confidential.
async fn fetch_missing_discharges(
    blessings: &Blessings,
    cache: &fabric_security::discharge::DischargeCache,
    discharge_fetcher: &dyn DischargeFetcher,
    now: u64,
) -> Result<HashMap<[u8; 32], Discharge>> {
    let mut out = HashMap::new();
    for chain in blessings.chains() {
        let server_names: Vec<String> = vec![chain.name()];
        for cert in chain.certificates() {
            for caveat in &cert.caveats {
                if let Caveat::ThirdParty {
                    third_party_id,
                    discharger_location,
                    requested_caveats,
                    non_confidential,
                    ..
                } = caveat
                {
                    if out.contains_key(third_party_id) {
                        continue;
                    }
                    let fingerprint = impetus::fingerprint(&Impetus {
                        server_blessing_names: &server_names,
                        method: "",
                        args: &[],
                        non_confidential: *non_confidential,
                    });
                    if let Some(cached) = cache.get(*third_party_id, fingerprint, now) {
                        out.insert(*third_party_id, cached);
                        continue;
                    }
                    // A discharger that can't be reached is an authentication
                    // failure from this call's point of view, never a bare
                    // connection failure: the circuit to the real peer may be
                    // fine, it's the credential fetch that failed.
                    let discharge = discharge_fetcher
                        .fetch(*third_party_id, discharger_location, requested_caveats)
                        .await
                        .map_err(|e| TransportError::AuthFailed(format!("fetching discharge from {discharger_location}: {e}")))?;
                    cache.insert(fingerprint, discharge.clone());
                    out.insert(*third_party_id, discharge);
                }
            }
        }
    }
    Ok(out)
}
