//! # fabric-runtime
//!
//! The ambient stack tying the four core subsystems into a runnable
//! process: layered configuration, structured logging setup, and the wire
//! bridges that let `fabric-naming`'s resolver and `fabric-security`'s
//! third-party caveats reach a *remote* mount table or discharger through
//! `fabric-transport`, rather than only an in-process one.
//!
//! ## Modules
//!
//! - [`config`] — layered configuration (defaults → file → environment) for
//!   listen-specs, namespace roots, the credentials directory, and the
//!   agent socket (§4.K)
//! - [`logging`] — the one process-wide `tracing` subscriber every binary
//!   in this workspace installs at startup (§4.J)
//! - [`mount_rpc`] — [`fabric_naming::resolver::MountTableService`] bridged
//!   over [`fabric_transport::call::Call`], both the client
//!   (`RpcMountTableClient`) and server (`serve_circuit`/`run_server`) halves,
//!   plus `RpcServiceResolver` for dialing a mount's redirect target fresh
//! - [`discharge`] — [`fabric_transport::handshake::DischargeFetcher`]
//!   bridged the same way, for fetching (or serving) third-party discharges
//!   over the wire

pub mod config;
pub mod discharge;
pub mod logging;
pub mod mount_rpc;

pub use config::RuntimeConfig;
pub use discharge::{RpcDischargeFetcher, DEFAULT_DISCHARGE_TTL};
pub use mount_rpc::{RpcMountTableClient, RpcServiceResolver};

/// Errors raised assembling or running the ambient runtime stack itself
/// (configuration loading), as distinct from the subsystem errors
/// `mount_rpc` and `discharge` simply forward from `fabric-transport` and
/// `fabric-naming`.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),
}

impl fabric_types::IntoFabricError for RuntimeError {
    fn kind(&self) -> fabric_types::ErrorKind {
        fabric_types::ErrorKind::Internal
    }
}
