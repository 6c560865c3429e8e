//! # fabric-transport
//!
//! The RPC transport and authentication handshake (components F and G): a
//! QUIC-backed virtual circuit carrying multiplexed flows, the dial/listen/
//! proxy machinery that gets two endpoints onto a circuit, and the mutual
//! blessing handshake that runs the first time a flow opens on a fresh one.
//!
//! ## Modules
//!
//! - [`quic`] — the QUIC node wrapper: self-signed TLS for transport
//!   encryption only, length-prefixed message framing
//! - [`messages`] — wire envelopes for the handshake and for flow control
//! - [`handshake`] — the mutual blessing exchange (§4.G)
//! - [`flow`] — a multiplexed bidirectional stream with a back-pressure
//!   window and a terminal-state machine
//! - [`dial`] — parallel dial across an endpoint set with a retry budget
//! - [`listen`] — binding a listen-spec, including proxied reverse-dial
//! - [`proxy`] — the reverse-dial relay: registers servers by routing-id and
//!   forwards inbound flows to them
//! - [`call`] — the streaming call API (`StartCall`/`Send`/`Recv`/`Finish`)
//!   and cancellation

pub mod call;
pub mod dial;
pub mod flow;
pub mod handshake;
pub mod listen;
pub mod messages;
pub mod proxy;
pub mod quic;

pub use call::{Call, CallOptions, StartCallInfo};
pub use dial::{DialPolicy, DialedCircuit, Dialer};
pub use flow::{Flow, FlowState};
pub use handshake::{DischargeFetcher, HandshakeOutcome, NoDischargeFetcher, Role};
pub use listen::{IncomingCircuit, ListenSpec, Listener};
pub use proxy::ProxyRelay;
pub use quic::{QuicConfig, QuicNode};

/// Errors raised by the transport subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A dial, accept, or stream I/O operation failed. Retryable within a
    /// call's retry budget, and only before any application data has been
    /// delivered.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The authentication handshake failed: a bad signature, an
    /// unrecognized root, a failing caveat, or an unreachable discharger.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The call's context was canceled before it completed.
    #[error("canceled")]
    Canceled,

    /// The call's deadline passed before it completed.
    #[error("timeout")]
    Timeout,

    /// A received frame violated the wire protocol (bad length, unknown
    /// frame kind, window overrun).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Wraps a naming-subsystem failure encountered while resolving a name
    /// to dial.
    #[error(transparent)]
    Naming(#[from] fabric_naming::NamingError),

    /// Wraps an endpoint codec failure.
    #[error(transparent)]
    Endpoint(#[from] fabric_types::EndpointError),

    /// An invariant was violated; this is a bug.
    #[error("internal transport error: {0}")]
    Internal(String),

    /// The remote handler reported an application-level failure, carrying
    /// the shared error kind so callers can match on it without parsing
    /// `message`.
    #[error("{kind}: {message}", kind = kind.as_str())]
    Application {
        /// The remote's reported error kind.
        kind: fabric_types::ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl fabric_types::IntoFabricError for TransportError {
    fn kind(&self) -> fabric_types::ErrorKind {
        use fabric_types::ErrorKind;
        match self {
            TransportError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            TransportError::AuthFailed(_) => ErrorKind::AuthFailed,
            TransportError::Canceled => ErrorKind::Canceled,
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Protocol(_) => ErrorKind::Internal,
            TransportError::Naming(e) => fabric_types::IntoFabricError::kind(e),
            TransportError::Endpoint(e) => fabric_types::IntoFabricError::kind(e),
            TransportError::Internal(_) => ErrorKind::Internal,
            TransportError::Application { kind, .. } => *kind,
        }
    }
}

/// Convenience result type for the transport subsystem.
pub type Result<T> = std::result::Result<T, TransportError>;

/// The ALPN protocol identifier this codec version speaks. Tied to
/// [`fabric_types::endpoint::CURRENT_VERSION`] so a version bump to either
/// the endpoint codec or the wire protocol is a visible, deliberate act
/// rather than a silent drift between the two.
pub fn alpn_identifier() -> Vec<u8> {
    format!("fabricrpc/{}", fabric_types::endpoint::CURRENT_VERSION).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_identifier_matches_endpoint_version() {
        assert_eq!(alpn_identifier(), b"fabricrpc/5");
    }
}
