//! Wire envelopes carried over a circuit's flows.
//!
//! Every frame sent on a flow is a [`Frame`], CBOR-encoded and written with
//! [`crate::quic::QuicNode::send_message`]'s length prefix. The first flow a
//! circuit opens carries only [`HandshakeFrame`] values until the handshake
//! completes; every later flow carries only [`CallFrame`] values.

use serde::{Deserialize, Serialize};

use fabric_types::ErrorKind;

/// Maximum frame size accepted on any flow. Chosen generously above a
/// typical encoded blessing chain while still bounding worst-case
/// allocation from an untrusted peer.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// The first thing written to every flow, naming which server's routing id
/// the flow is ultimately destined for. An ordinary listener that terminates
/// flows itself just reads and discards this; [`crate::proxy::ProxyRelay`]
/// reads it to pick a registered connection to forward to, and re-sends an
/// identical header on the flow it opens against that connection so the
/// framing a terminating listener sees is the same whether or not a proxy
/// sat in the middle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FlowHeader {
    /// Raw bytes of the target server's routing id.
    pub target_routing_id: [u8; 16],
}

/// Frames exchanged on the dedicated registration flow a server opens on
/// its outbound connection to a proxy (§4.F's reverse-dial).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProxyFrame {
    /// Sent once, immediately after the flow opens: "route inbound flows
    /// addressed to this routing id to me."
    Register {
        /// Raw bytes of the registering server's routing id.
        routing_id: [u8; 16],
    },
    /// The proxy's reply once the registration is recorded.
    RegisterAck,
    /// The proxy declines the registration (e.g. the routing id is already
    /// registered by a different live connection).
    RegisterRejected {
        /// Human-readable reason.
        reason: String,
    },
}

/// Either shape the very first frame on a freshly accepted connection can
/// take, from [`crate::proxy::ProxyRelay`]'s point of view: a server
/// registering itself, or an ordinary client flow naming its target.
pub enum FirstFrame {
    /// A server's registration request.
    Control(ProxyFrame),
    /// An ordinary flow heading to some routing id.
    Targeted(FlowHeader),
}

/// Decode the first frame off a freshly accepted flow without knowing in
/// advance which of the two shapes it takes. Tries [`ProxyFrame`] first
/// since it is the less common case (one registration flow per server
/// connection versus one header per client flow).
pub fn decode_first_frame(bytes: &[u8]) -> crate::Result<FirstFrame> {
    if let Ok(frame) = decode::<ProxyFrame>(bytes) {
        return Ok(FirstFrame::Control(frame));
    }
    decode::<FlowHeader>(bytes).map(FirstFrame::Targeted)
}

/// A frame exchanged during the mutual blessing handshake (§4.G).
///
/// The handshake runs in two interleaved rounds per side: each side sends
/// an `Offer` as soon as it is ready, then a `Confirm` once it has
/// validated the peer's offer and selected its own blessings to present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HandshakeFrame {
    /// The sender's blessings, a fresh nonce, and the discharges it is
    /// presenting for any third-party caveats on those blessings.
    Offer {
        /// CBOR-encoded `fabric_security::blessings::Blessings`.
        blessings: Vec<u8>,
        /// CBOR-encoded `Vec<fabric_security::discharge::Discharge>`.
        discharges: Vec<u8>,
        /// Random nonce contributed to the signed transcript.
        nonce: [u8; 32],
        /// Chosen by the acceptor and echoed back unchanged by the
        /// initiator's own `Offer`, binding both transcripts to the same
        /// handshake even when this flow was spliced through a proxy relay
        /// and the two hops never shared a TLS session.
        session_id: [u8; 32],
    },
    /// A signature over the session transcript, sent once the sender has
    /// validated the peer's `Offer` and knows both nonces and the session
    /// id.
    Confirm {
        /// Ed25519 signature over
        /// `nonce_local || session_id || nonce_remote`.
        signature: Vec<u8>,
    },
    /// Terminates the handshake with a reason instead of a `Confirm`, e.g.
    /// an unrecognized root or a caveat that will never be satisfiable.
    Reject {
        /// Human-readable reason, surfaced in the resulting `AuthFailed`.
        reason: String,
    },
}

/// A frame exchanged on an application flow after the handshake completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CallFrame {
    /// Starts a call: the method name and the caller's impetus (used by the
    /// callee to evaluate its own caveats and to fetch discharges keyed on
    /// the impetus fingerprint).
    StartCall {
        /// Fully qualified method name being invoked.
        method: String,
        /// Number of positional arguments that will follow as `Send`
        /// frames before `FinishSend`.
        num_args: u32,
        /// Whether the caller considers the arguments non-confidential
        /// (see `fabric_security::impetus::Impetus::non_confidential`).
        non_confidential: bool,
    },
    /// One streamed argument or result value.
    Send {
        /// CBOR-encoded application value.
        payload: Vec<u8>,
    },
    /// The sender has no more `Send` frames to emit in this direction.
    FinishSend,
    /// The callee accepts the call and will begin streaming results.
    Accept,
    /// The call completed successfully; no more frames follow.
    Finish,
    /// The call failed; no more frames follow.
    Error {
        /// The shared error-kind tag, so the caller can decide whether to
        /// retry without needing to parse `message`.
        kind: WireErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// Either side is abandoning the call before it finished normally.
    Cancel,
}

/// A serializable mirror of [`fabric_types::ErrorKind`]. Kept as a separate
/// type rather than deriving `Serialize` on `ErrorKind` itself, so the wire
/// format is pinned independently of that enum's internal representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorKind {
    MalformedEndpoint,
    MalformedName,
    NoSuchName,
    NoSuchNameRoot,
    NamingLoop,
    MtFlagMismatch,
    BadVersion,
    NoAccess,
    AuthFailed,
    PublicKeyMismatch,
    UnrecognizedRoot,
    InvalidCaveat,
    ImmutableStore,
    Canceled,
    Timeout,
    ConnectionFailed,
    Internal,
}

impl From<ErrorKind> for WireErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::MalformedEndpoint => WireErrorKind::MalformedEndpoint,
            ErrorKind::MalformedName => WireErrorKind::MalformedName,
            ErrorKind::NoSuchName => WireErrorKind::NoSuchName,
            ErrorKind::NoSuchNameRoot => WireErrorKind::NoSuchNameRoot,
            ErrorKind::NamingLoop => WireErrorKind::NamingLoop,
            ErrorKind::MtFlagMismatch => WireErrorKind::MtFlagMismatch,
            ErrorKind::BadVersion => WireErrorKind::BadVersion,
            ErrorKind::NoAccess => WireErrorKind::NoAccess,
            ErrorKind::AuthFailed => WireErrorKind::AuthFailed,
            ErrorKind::PublicKeyMismatch => WireErrorKind::PublicKeyMismatch,
            ErrorKind::UnrecognizedRoot => WireErrorKind::UnrecognizedRoot,
            ErrorKind::InvalidCaveat => WireErrorKind::InvalidCaveat,
            ErrorKind::ImmutableStore => WireErrorKind::ImmutableStore,
            ErrorKind::Canceled => WireErrorKind::Canceled,
            ErrorKind::Timeout => WireErrorKind::Timeout,
            ErrorKind::ConnectionFailed => WireErrorKind::ConnectionFailed,
            ErrorKind::Internal => WireErrorKind::Internal,
        }
    }
}

impl From<WireErrorKind> for ErrorKind {
    fn from(kind: WireErrorKind) -> Self {
        match kind {
            WireErrorKind::MalformedEndpoint => ErrorKind::MalformedEndpoint,
            WireErrorKind::MalformedName => ErrorKind::MalformedName,
            WireErrorKind::NoSuchName => ErrorKind::NoSuchName,
            WireErrorKind::NoSuchNameRoot => ErrorKind::NoSuchNameRoot,
            WireErrorKind::NamingLoop => ErrorKind::NamingLoop,
            WireErrorKind::MtFlagMismatch => ErrorKind::MtFlagMismatch,
            WireErrorKind::BadVersion => ErrorKind::BadVersion,
            WireErrorKind::NoAccess => ErrorKind::NoAccess,
            WireErrorKind::AuthFailed => ErrorKind::AuthFailed,
            WireErrorKind::PublicKeyMismatch => ErrorKind::PublicKeyMismatch,
            WireErrorKind::UnrecognizedRoot => ErrorKind::UnrecognizedRoot,
            WireErrorKind::InvalidCaveat => ErrorKind::InvalidCaveat,
            WireErrorKind::ImmutableStore => ErrorKind::ImmutableStore,
            WireErrorKind::Canceled => ErrorKind::Canceled,
            WireErrorKind::Timeout => ErrorKind::Timeout,
            WireErrorKind::ConnectionFailed => ErrorKind::ConnectionFailed,
            WireErrorKind::Internal => ErrorKind::Internal,
        }
    }
}

/// Encode a frame to its CBOR wire representation.
pub fn encode<T: Serialize>(frame: &T) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(frame, &mut buf)
        .map_err(|e| crate::TransportError::Protocol(format!("frame encode failed: {e}")))?;
    Ok(buf)
}

/// Decode a frame from its CBOR wire representation.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> crate::Result<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| crate::TransportError::Protocol(format!("frame decode failed: {e}")))
}
