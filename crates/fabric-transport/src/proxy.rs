//! The reverse-dial relay (§4.F).
//!
//! A server behind a proxy never accepts an inbound connection itself: it
//! dials the proxy, registers its routing id on a dedicated flow, and from
//! then on the proxy is the one thing the outside world connects to.
//! Watching the server's own network interface would show only that one
//! outbound connection.
//!
//! Every flow the proxy forwards starts the same way a direct listener's
//! flows do — with a [`crate::messages::FlowHeader`] naming the target
//! routing id — so [`crate::listen::Listener`] cannot tell whether a given
//! circuit was proxied or direct. The registration flow is the one
//! exception: it carries a [`crate::messages::ProxyFrame`] instead, which
//! is how the relay tells the two kinds of inbound flow apart.

use std::collections::HashMap;
use std::sync::Arc;

use quinn::Connection;
use tokio::sync::RwLock;

use fabric_types::endpoint::RoutingId;

use crate::flow::Flow;
use crate::messages::{self, FirstFrame, ProxyFrame};
use crate::quic::{QuicConfig, QuicNode};
use crate::{Result, TransportError};

/// Routes inbound flows to servers that have registered a routing id on an
/// outbound connection to this relay.
pub struct ProxyRelay {
    node: QuicNode,
    registrations: Arc<RwLock<HashMap<RoutingId, Connection>>>,
}

impl ProxyRelay {
    /// Bind a relay at `config.bind_addr`.
    pub fn new(config: QuicConfig) -> Result<Self> {
        let node = QuicNode::new(config)?;
        Ok(Self { node, registrations: Arc::new(RwLock::new(HashMap::new())) })
    }

    /// This relay's bound address, the address servers dial to register and
    /// clients dial to reach them.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.node.local_addr()
    }

    /// Accept connections forever, dispatching each to
    /// [`Self::handle_connection`] on its own task. Returns only if the
    /// underlying endpoint is closed.
    pub async fn serve(self: Arc<Self>) {
        while let Some(incoming) = self.node.accept().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => this.handle_connection(connection).await,
                    Err(e) => tracing::debug!(error = %e, "proxy: incoming connection failed"),
                }
            });
        }
    }

    /// Handle every flow opened on one accepted connection, forwarding
    /// forever until the connection closes. The connection might belong to
    /// a registering server (its flows never arrive, only its registration
    /// flow does) or a dialing client (every flow carries a `FlowHeader`).
    async fn handle_connection(&self, connection: Connection) {
        loop {
            let mut flow = match Flow::accept(&connection).await {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::debug!(error = %e, "proxy: connection ended");
                    return;
                }
            };

            let raw = match flow.recv_raw().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(error = %e, "proxy: failed to read first frame");
                    continue;
                }
            };

            match messages::decode_first_frame(&raw) {
                Ok(FirstFrame::Control(ProxyFrame::Register { routing_id })) => {
                    let routing_id = RoutingId(routing_id);
                    self.registrations.write().await.insert(routing_id, connection.clone());
                    if let Err(e) = flow.send_frame(&ProxyFrame::RegisterAck).await {
                        tracing::debug!(error = %e, "proxy: failed to ack registration");
                    }
                    tracing::info!(%routing_id, "proxy: server registered");
                }
                Ok(FirstFrame::Control(_)) => {
                    tracing::debug!("proxy: unexpected control frame on inbound flow");
                }
                Ok(FirstFrame::Targeted(header)) => {
                    let target = RoutingId(header.target_routing_id);
                    if let Err(e) = self.forward(flow, target).await {
                        tracing::warn!(%target, error = %e, "proxy: forwarding failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "proxy: first frame was neither a header nor a control frame");
                }
            }
        }
    }

    /// Open a matching flow on the registered connection for `target`,
    /// re-send an identical `FlowHeader` on it (so the terminating
    /// listener's framing is uniform whether or not a proxy sat in the
    /// middle), then splice the two flows' raw bytes together until either
    /// side closes.
    async fn forward(&self, inbound: Flow, target: RoutingId) -> Result<()> {
        let registered = {
            let registrations = self.registrations.read().await;
            registrations.get(&target).cloned()
        };
        let Some(registered) = registered else {
            return Err(TransportError::ConnectionFailed(format!("no server registered for routing id {target}")));
        };

        let outbound = Flow::open_targeted(&registered, target).await?;
        splice(inbound, outbound).await
    }
}

/// Copy bytes in both directions between two flows until either direction
/// closes, then tear down the other. Neither side's frames are interpreted;
/// the relay never has a reason to parse a `CallFrame`.
async fn splice(a: Flow, b: Flow) -> Result<()> {
    let (mut a_send, mut a_recv) = a.into_raw();
    let (mut b_send, mut b_recv) = b.into_raw();

    let a_to_b = tokio::io::copy(&mut a_recv, &mut b_send);
    let b_to_a = tokio::io::copy(&mut b_recv, &mut a_send);

    let result = tokio::try_join!(a_to_b, b_to_a);
    let _ = a_send.finish();
    let _ = b_send.finish();
    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(TransportError::ConnectionFailed(format!("splice failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_forwards_a_flow_to_the_registered_server() {
        let relay = Arc::new(ProxyRelay::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() }).expect("test setup"));
        let relay_addr = relay.local_addr();
        tokio::spawn(Arc::clone(&relay).serve());

        let routing_id = RoutingId::generate();

        let server = QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() }).expect("test setup");
        let registration_connection = server.connect(relay_addr, "fabric-node").await.expect("test setup");
        let mut registration_flow = Flow::open(&registration_connection).await.expect("test setup");
        registration_flow
            .send_frame(&ProxyFrame::Register { routing_id: routing_id.0 })
            .await
            .expect("test setup");
        let ack: ProxyFrame = registration_flow.recv_frame().await.expect("test setup");
        assert!(matches!(ack, ProxyFrame::RegisterAck));

        let server_task = tokio::spawn(async move {
            let (mut flow, target) = Flow::accept_targeted(&registration_connection).await.expect("test setup");
            assert_eq!(target, routing_id);
            let payload: Vec<u8> = flow.recv_frame().await.expect("test setup");
            payload
        });

        let client = QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() }).expect("test setup");
        let client_connection = client.connect(relay_addr, "fabric-node").await.expect("test setup");
        let mut client_flow = Flow::open_targeted(&client_connection, routing_id).await.expect("test setup");
        client_flow.send_frame(&vec![1u8, 2, 3]).await.expect("test setup");

        let received = server_task.await.expect("test setup");
        assert_eq!(received, vec![1u8, 2, 3]);
    }
}
