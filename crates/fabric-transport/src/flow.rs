//! A single multiplexed bidirectional flow on top of a QUIC connection.
//!
//! One flow carries one logical conversation: the handshake flow carries
//! [`crate::messages::HandshakeFrame`] values, every later flow opened on
//! the same circuit carries [`crate::messages::CallFrame`] values for one
//! call. Quinn's own per-stream flow control supplies the back-pressure
//! window; `Flow` just tracks the coarser open/half-closed/closed state
//! machine callers need to reason about cancellation and reuse.

use quinn::{Connection, RecvStream, SendStream};
use serde::{Deserialize, Serialize};

use crate::quic::QuicNode;
use crate::{Result, TransportError};

/// Maximum size of a single framed message read from a flow.
pub const MAX_MESSAGE_SIZE: usize = super::messages::MAX_FRAME_SIZE;

/// The lifecycle state of a [`Flow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    /// Both directions are open.
    Open,
    /// This side has finished sending; the peer may still send.
    SendHalfClosed,
    /// The peer has finished sending; this side may still send.
    RecvHalfClosed,
    /// Both directions finished normally.
    Closed,
    /// The flow ended abnormally (protocol error, cancellation, reset).
    Errored,
}

/// One bidirectional QUIC stream, framed with length-prefixed CBOR messages.
pub struct Flow {
    send: SendStream,
    recv: RecvStream,
    state: FlowState,
}

impl Flow {
    /// Open a new flow on `connection`. The first flow a circuit opens is
    /// conventionally the handshake flow; every flow after that is a call.
    pub async fn open(connection: &Connection) -> Result<Self> {
        let (send, recv) = QuicNode::open_bi(connection).await?;
        Ok(Self { send, recv, state: FlowState::Open })
    }

    /// Accept the peer's next flow on `connection`.
    pub async fn accept(connection: &Connection) -> Result<Self> {
        let (send, recv) = QuicNode::accept_bi(connection).await?;
        Ok(Self { send, recv, state: FlowState::Open })
    }

    /// Open a new flow and immediately write its [`crate::messages::FlowHeader`],
    /// naming which server's routing id the flow is ultimately destined
    /// for. Every flow this crate opens, proxied or not, starts this way.
    pub async fn open_targeted(connection: &Connection, target_routing_id: fabric_types::endpoint::RoutingId) -> Result<Self> {
        let mut flow = Self::open(connection).await?;
        flow.send_frame(&super::messages::FlowHeader { target_routing_id: target_routing_id.0 }).await?;
        Ok(flow)
    }

    /// Accept the peer's next flow and read off its
    /// [`crate::messages::FlowHeader`], returning the target routing id it named.
    pub async fn accept_targeted(connection: &Connection) -> Result<(Self, fabric_types::endpoint::RoutingId)> {
        let mut flow = Self::accept(connection).await?;
        let header: super::messages::FlowHeader = flow.recv_frame().await?;
        Ok((flow, fabric_types::endpoint::RoutingId(header.target_routing_id)))
    }

    /// Tear down the framing and hand back the raw QUIC streams
    /// underneath. [`crate::proxy::ProxyRelay`] uses this to splice an
    /// inbound flow's bytes directly onto an outbound one, without
    /// interpreting anything past the `FlowHeader` it already stripped.
    pub fn into_raw(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Receive one frame's raw encoded bytes without committing to a type,
    /// for callers that must inspect a frame before knowing which of two
    /// shapes it is (see [`crate::messages::decode_first_frame`]).
    pub async fn recv_raw(&mut self) -> Result<Vec<u8>> {
        self.ensure_recvable()?;
        QuicNode::recv_message(&mut self.recv, MAX_MESSAGE_SIZE).await.map_err(|e| {
            self.state = FlowState::Errored;
            e
        })
    }

    /// Serialize and send one frame.
    pub async fn send_frame<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        self.ensure_sendable()?;
        let encoded = super::messages::encode(frame)?;
        QuicNode::send_message(&mut self.send, &encoded).await.map_err(|e| {
            self.state = FlowState::Errored;
            e
        })
    }

    /// Receive and deserialize one frame.
    pub async fn recv_frame<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        self.ensure_recvable()?;
        let bytes = QuicNode::recv_message(&mut self.recv, MAX_MESSAGE_SIZE).await.map_err(|e| {
            self.state = FlowState::Errored;
            e
        })?;
        super::messages::decode(&bytes)
    }

    /// Finish the send half: no more frames will be sent on this flow.
    pub fn finish_send(&mut self) -> Result<()> {
        self.ensure_sendable()?;
        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionFailed(format!("finish: {e}")))?;
        self.state = match self.state {
            FlowState::Open => FlowState::SendHalfClosed,
            FlowState::RecvHalfClosed => FlowState::Closed,
            other => other,
        };
        Ok(())
    }

    /// Mark the recv half as finished, normally after the peer's stream
    /// reports end-of-stream.
    pub fn mark_recv_finished(&mut self) {
        self.state = match self.state {
            FlowState::Open => FlowState::RecvHalfClosed,
            FlowState::SendHalfClosed => FlowState::Closed,
            other => other,
        };
    }

    /// Abruptly reset the flow, used for mid-call cancellation.
    pub fn reset(&mut self, error_code: u32) {
        let _ = self.send.reset(quinn::VarInt::from_u32(error_code));
        self.recv.stop(quinn::VarInt::from_u32(error_code)).ok();
        self.state = FlowState::Errored;
    }

    fn ensure_sendable(&self) -> Result<()> {
        match self.state {
            FlowState::Open | FlowState::RecvHalfClosed => Ok(()),
            FlowState::SendHalfClosed | FlowState::Closed => Err(TransportError::Protocol(
                "flow send half already finished".to_string(),
            )),
            FlowState::Errored => Err(TransportError::ConnectionFailed("flow is in an error state".to_string())),
        }
    }

    fn ensure_recvable(&self) -> Result<()> {
        match self.state {
            FlowState::Open | FlowState::SendHalfClosed => Ok(()),
            FlowState::RecvHalfClosed | FlowState::Closed => Err(TransportError::Protocol(
                "flow recv half already finished".to_string(),
            )),
            FlowState::Errored => Err(TransportError::ConnectionFailed("flow is in an error state".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::{QuicConfig, QuicNode};
    use crate::messages::CallFrame;

    #[tokio::test]
    async fn open_flow_rejects_send_after_finish() {
        let server = QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() })
            .expect("bind server");
        let addr = server.local_addr();
        let client = QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() })
            .expect("bind client");

        let server_task = tokio::spawn(async move {
            let incoming = server.accept().await.expect("incoming");
            let connection = incoming.await.expect("accept connection");
            Flow::accept(&connection).await.expect("accept flow")
        });

        let client_connection = client.connect(addr, "fabric-node").await.expect("connect");
        let mut flow = Flow::open(&client_connection).await.expect("open flow");
        let _server_flow = server_task.await.expect("join");

        flow.send_frame(&CallFrame::Cancel).await.expect("first send");
        flow.finish_send().expect("finish");
        assert_eq!(flow.state(), FlowState::SendHalfClosed);
        assert!(flow.send_frame(&CallFrame::Cancel).await.is_err());
    }
}
