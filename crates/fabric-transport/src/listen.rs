//! Binding a listen spec, direct or behind a reverse-dial proxy (§4.F).
//!
//! A [`Listener`] owns exactly one physical connection per circuit: a fresh
//! inbound QUIC connection when bound directly, or the single long-lived
//! registration connection to a [`crate::proxy::ProxyRelay`] when proxied.
//! [`Listener::accept_circuit`] consumes that connection's first flow
//! running the acceptor side of the handshake; every flow after that is a
//! call, accepted with [`crate::call::Call::accept`].
//!
//! A proxied listener only ever has one registration connection, so it can
//! only have one live, handshaked circuit at a time: the relay splices
//! flows without tagging which client they came from, so there is no way to
//! tell a second client's handshake offer apart from a first client's later
//! call. A second caller arriving while the first circuit is still live
//! will simply fail to decode against whichever phase the shared connection
//! is currently in, rather than ever being authenticated as the wrong peer.

use std::net::SocketAddr;

use fabric_security::Principal;
use fabric_types::endpoint::RoutingId;
use fabric_types::Endpoint;

use crate::flow::Flow;
use crate::handshake::{self, DischargeFetcher, HandshakeOutcome, Role};
use crate::messages::ProxyFrame;
use crate::quic::{QuicConfig, QuicNode};
use crate::{Result, TransportError};

/// Where and how a [`Listener`] should be reachable.
#[derive(Clone)]
pub struct ListenSpec {
    /// Local address to bind to (ignored when `proxy` is set; the listener
    /// still needs an ephemeral local address to dial out from, but it is
    /// not where callers connect).
    pub bind_addr: SocketAddr,
    /// The protocol name recorded in the published [`Endpoint`].
    pub protocol: String,
    /// When set, this listener never accepts inbound connections itself:
    /// it dials the relay at this address and registers for reverse-dial
    /// instead (§4.F).
    pub proxy: Option<SocketAddr>,
}

impl Default for ListenSpec {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            protocol: "quic".to_string(),
            proxy: None,
        }
    }
}

enum Transport {
    Direct(QuicNode),
    Proxied { node: QuicNode, proxy_addr: SocketAddr, connection: quinn::Connection },
}

/// A bound listener, ready to accept authenticated circuits.
pub struct Listener {
    routing_id: RoutingId,
    protocol: String,
    transport: Transport,
}

/// One authenticated circuit, ready for [`crate::call::Call::accept`] to
/// pull calls off it.
pub struct IncomingCircuit {
    /// The live QUIC connection backing the circuit.
    pub connection: quinn::Connection,
    /// What the handshake established about the caller.
    pub handshake: HandshakeOutcome,
}

impl Listener {
    /// Bind `spec`, registering with its proxy if one is configured.
    pub async fn bind(spec: ListenSpec, routing_id: RoutingId) -> Result<Self> {
        let transport = match spec.proxy {
            None => {
                let node = QuicNode::new(QuicConfig { bind_addr: spec.bind_addr, ..Default::default() })?;
                Transport::Direct(node)
            }
            Some(proxy_addr) => {
                let node = QuicNode::new(QuicConfig { bind_addr: spec.bind_addr, ..Default::default() })?;
                let connection = node.connect(proxy_addr, "fabric-node").await?;
                let mut flow = Flow::open(&connection).await?;
                flow.send_frame(&ProxyFrame::Register { routing_id: routing_id.0 }).await?;
                let ack: ProxyFrame = flow.recv_frame().await?;
                match ack {
                    ProxyFrame::RegisterAck => {}
                    ProxyFrame::RegisterRejected { reason } => {
                        return Err(TransportError::ConnectionFailed(format!("proxy rejected registration: {reason}")))
                    }
                    ProxyFrame::Register { .. } => {
                        return Err(TransportError::Protocol("unexpected Register echoed back".to_string()))
                    }
                }
                tracing::info!(%proxy_addr, %routing_id, "registered with proxy");
                Transport::Proxied { node, proxy_addr, connection }
            }
        };
        Ok(Self { routing_id, protocol: spec.protocol, transport })
    }

    /// The routing id this listener accepts flows for.
    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    /// The [`Endpoint`] other nodes should dial to reach this listener:
    /// the proxy's address when proxied, this node's own bound address
    /// otherwise.
    pub fn published_endpoint(&self, is_mount_table: bool, blessing_names: Vec<String>) -> Endpoint {
        let address = match &self.transport {
            Transport::Direct(node) => node.local_addr().to_string(),
            Transport::Proxied { proxy_addr, .. } => proxy_addr.to_string(),
        };
        Endpoint::new(self.protocol.clone(), address)
            .with_routing_id(self.routing_id)
            .with_mount_table(is_mount_table)
            .with_blessing_names(blessing_names)
    }

    /// Accept the next circuit: a fresh inbound connection when direct, or
    /// (at most once concurrently) the registration connection's first
    /// flow when proxied. Runs the acceptor side of the handshake before
    /// returning.
    pub async fn accept_circuit(
        &self,
        principal: &dyn Principal,
        discharge_fetcher: &dyn DischargeFetcher,
        now: u64,
    ) -> Result<IncomingCircuit> {
        match &self.transport {
            Transport::Direct(node) => {
                let incoming = node
                    .accept()
                    .await
                    .ok_or_else(|| TransportError::ConnectionFailed("listener closed".to_string()))?;
                let connection = incoming
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(format!("accept: {e}")))?;
                let (mut flow, target) = Flow::accept_targeted(&connection).await?;
                if target != self.routing_id {
                    tracing::warn!(expected = %self.routing_id, got = %target, "flow targeted a different routing id");
                }
                let handshake = handshake::run(&mut flow, Role::Acceptor, principal, discharge_fetcher, now).await?;
                Ok(IncomingCircuit { connection, handshake })
            }
            Transport::Proxied { connection, .. } => {
                let (mut flow, _target) = Flow::accept_targeted(connection).await?;
                let handshake = handshake::run(&mut flow, Role::Acceptor, principal, discharge_fetcher, now).await?;
                Ok(IncomingCircuit { connection: connection.clone(), handshake })
            }
        }
    }
}
