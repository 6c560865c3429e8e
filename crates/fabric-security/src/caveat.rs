//! Caveats and the call context they are evaluated against (§4.C).

use fabric_types::Endpoint;
use serde::{Deserialize, Serialize};

use crate::discharge::Discharge;
use crate::pattern::BlessingPattern;
use fabric_crypto::ed25519::VerifyingKey;

/// A constraint attached to a certificate, restricting when the blessing it
/// extends may be used.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Caveat {
    /// Passes iff `now <= not_after` (unix seconds).
    Expiry {
        /// Latest unix-second timestamp at which this caveat still passes.
        not_after: u64,
    },
    /// Passes iff the invoked method is one of `methods`.
    Method {
        /// Allowed method names.
        methods: Vec<String>,
    },
    /// Passes iff the peer's already-approved names match at least one of
    /// `patterns`.
    PeerBlessing {
        /// Patterns at least one of which the peer must match.
        patterns: Vec<BlessingPattern>,
    },
    /// Passes iff a discharge from `discharger_public_key` is present in the
    /// call context for `third_party_id`, and every caveat embedded in that
    /// discharge itself passes.
    ThirdParty {
        /// Identifies this specific caveat instance for discharge lookup.
        third_party_id: [u8; 32],
        /// The discharger's verifying key; a discharge must be signed by
        /// this key to satisfy the caveat.
        discharger_public_key: VerifyingKey,
        /// Name at which the discharger can be reached.
        discharger_location: String,
        /// Caveats the discharger is asked to embed in the discharge it
        /// mints. The discharger may narrow these but not widen them.
        requested_caveats: Vec<Caveat>,
        /// If true, the method and arguments are excluded from the impetus
        /// fingerprint used to key the discharge cache (§3); the discharge
        /// is reusable across calls to the same server regardless of
        /// method/args.
        non_confidential: bool,
    },
    /// A caveat id this codec version does not understand. Always fails to
    /// validate — unknown caveats are a conservative bug, not a pass.
    Unknown {
        /// The unrecognized caveat id.
        id: String,
        /// Opaque parameter bytes, preserved for re-serialization.
        params: Vec<u8>,
    },
}

/// Everything a caveat needs to evaluate against: the two endpoints of the
/// call, the method and argument bytes, the current time, and whatever
/// discharges are on hand.
pub struct CallContext<'a> {
    /// This side's endpoint, if known.
    pub local_endpoint: Option<&'a Endpoint>,
    /// The peer's endpoint, if known.
    pub remote_endpoint: Option<&'a Endpoint>,
    /// The method being invoked.
    pub method: &'a str,
    /// The method's argument bytes, one entry per argument, in order.
    pub args: &'a [Vec<u8>],
    /// Current unix-second time.
    pub now: u64,
    /// Blessing names the peer has already been approved for (used by
    /// `PeerBlessing`). Populated from the *other* side's chain validation.
    pub peer_approved_names: &'a [String],
    /// Discharges available for this call, keyed by third-party id.
    pub discharges: &'a std::collections::HashMap<[u8; 32], Discharge>,
}

impl Caveat {
    /// Evaluate this caveat against a call context.
    pub fn validate(&self, ctx: &CallContext<'_>) -> bool {
        match self {
            Caveat::Expiry { not_after } => ctx.now <= *not_after,
            Caveat::Method { methods } => methods.iter().any(|m| m == ctx.method),
            Caveat::PeerBlessing { patterns } => patterns
                .iter()
                .any(|p| p.matches_any(ctx.peer_approved_names.iter().map(String::as_str))),
            Caveat::ThirdParty {
                third_party_id,
                discharger_public_key,
                requested_caveats: _,
                non_confidential: _,
                discharger_location: _,
            } => match ctx.discharges.get(third_party_id) {
                Some(discharge) => {
                    discharge.verify_signature(discharger_public_key).is_ok()
                        && discharge.caveats.iter().all(|c| c.validate(ctx))
                }
                None => false,
            },
            Caveat::Unknown { .. } => false,
        }
    }
}
