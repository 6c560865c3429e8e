//! Structured logging initialization (§4.J).
//!
//! Every suspension point in the transport, naming, and security crates
//! already emits its own `tracing` spans and events; this module just wires
//! up the one process-wide subscriber that renders them. No component in
//! this workspace prints directly to stdout/stderr.

/// Install the global `tracing` subscriber, honoring `RUST_LOG` if set and
/// otherwise defaulting to `info` for every `fabric_*` crate.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fabric_types=info".parse()?)
                .add_directive("fabric_crypto=info".parse()?)
                .add_directive("fabric_security=info".parse()?)
                .add_directive("fabric_naming=info".parse()?)
                .add_directive("fabric_transport=info".parse()?)
                .add_directive("fabric_runtime=info".parse()?)
                .add_directive("fabric_agent=info".parse()?),
        )
        .init();
    Ok(())
}
