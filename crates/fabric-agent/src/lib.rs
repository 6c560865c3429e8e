//! # fabric-agent
//!
//! The security agent (component H): an out-of-process key custodian that
//! signs and blesses on behalf of short-lived client processes, so a
//! principal's private key need never touch the memory of every process
//! that wants to act as it.
//!
//! ## Modules
//!
//! - [`protocol`] — the request/response wire protocol and its
//!   length-prefixed CBOR framing (§4.H, §6)
//! - [`server`] — [`server::KeyManager`], which owns principals and serves
//!   each on its own Unix socket
//! - [`client`] — [`client::AgentPrincipal`], a [`fabric_security::Principal`]
//!   implementation that proxies every operation to a running agent

pub mod client;
pub mod protocol;
pub mod server;

pub use client::AgentPrincipal;
pub use server::{KeyManager, PrincipalHandle};

/// Errors raised talking to or serving the agent protocol.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The socket connection failed or a frame could not be read/written.
    #[error("agent io error: {0}")]
    Io(String),

    /// The agent replied with a response shape the client did not expect
    /// for the request it sent.
    #[error("agent protocol error: {0}")]
    Protocol(String),

    /// `serve_principal` was asked to serve a handle this `KeyManager` never
    /// minted.
    #[error("unknown principal handle")]
    UnknownPrincipal,
}

impl fabric_types::IntoFabricError for AgentError {
    fn kind(&self) -> fabric_types::ErrorKind {
        use fabric_types::ErrorKind;
        match self {
            AgentError::Io(_) => ErrorKind::ConnectionFailed,
            AgentError::Protocol(_) => ErrorKind::Internal,
            AgentError::UnknownPrincipal => ErrorKind::Internal,
        }
    }
}

/// Convenience result type for the agent subsystem.
pub type Result<T> = std::result::Result<T, AgentError>;
