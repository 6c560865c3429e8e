//! Dialing: turning a resolved name or a bare endpoint into an
//! authenticated circuit (§4.F, §4.G, §5).
//!
//! A dial races every candidate endpoint for a name and keeps the first one
//! to both connect and complete the handshake. Only
//! [`crate::TransportError::ConnectionFailed`] is retried — a handshake
//! failure means the peer is reachable but not who (or what) was expected,
//! and retrying it would just fail the same way again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use fabric_naming::resolver::Resolver;
use fabric_security::Principal;
use fabric_types::Endpoint;

use crate::flow::Flow;
use crate::handshake::{self, DischargeFetcher, HandshakeOutcome, Role};
use crate::quic::QuicNode;
use crate::{Result, TransportError};

/// Governs how a dial attempt retries transient failures.
#[derive(Clone, Copy, Debug)]
pub struct DialPolicy {
    /// Maximum number of connection attempts per candidate endpoint,
    /// including the first.
    pub max_attempts: u32,
    /// Delay before each retry. Doubles after every failed attempt, capped
    /// implicitly by `max_attempts`.
    pub initial_backoff: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// An authenticated circuit ready to carry calls, plus the suffix of the
/// originally resolved name that the reached server must still resolve
/// itself.
pub struct DialedCircuit {
    /// The live QUIC connection.
    pub connection: quinn::Connection,
    /// What the handshake established about the far end.
    pub handshake: HandshakeOutcome,
    /// Name suffix the reached server is responsible for resolving, empty
    /// when dialing a bare endpoint directly.
    pub suffix: String,
}

/// Dials endpoints and names on behalf of one [`QuicNode`].
pub struct Dialer {
    node: Arc<QuicNode>,
    policy: DialPolicy,
}

impl Dialer {
    /// Build a dialer over `node` with `policy` governing retries.
    pub fn new(node: Arc<QuicNode>, policy: DialPolicy) -> Self {
        Self { node, policy }
    }

    /// Dial a single endpoint directly, then run the handshake as the
    /// initiator.
    pub async fn dial_endpoint(
        &self,
        endpoint: &Endpoint,
        principal: &dyn Principal,
        discharge_fetcher: &dyn DischargeFetcher,
        now: u64,
    ) -> Result<DialedCircuit> {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .map_err(|e| TransportError::ConnectionFailed(format!("unparseable address {:?}: {e}", endpoint.address)))?;

        let connection = self.connect_with_retries(addr).await?;
        let handshake = self
            .run_initiator_handshake(&connection, endpoint.routing_id, principal, discharge_fetcher, now)
            .await?;

        Ok(DialedCircuit { connection, handshake, suffix: String::new() })
    }

    /// Resolve `name` against `resolver`, racing every candidate server and
    /// keeping the first to connect and authenticate successfully.
    pub async fn dial_name(
        &self,
        resolver: &Resolver,
        name: &str,
        caller_names: &[String],
        principal: &dyn Principal,
        discharge_fetcher: &dyn DischargeFetcher,
        now: u64,
    ) -> Result<DialedCircuit> {
        let resolved = resolver.resolve(name, now, caller_names).await?;
        if resolved.servers.is_empty() {
            return Err(TransportError::Naming(fabric_naming::NamingError::NoSuchName(name.to_string())));
        }

        // Race every candidate concurrently in this same task: each attempt
        // is pushed as its own future onto `attempts`, and `FuturesUnordered`
        // polls them all together rather than awaiting one to completion
        // before starting the next. The first to finish the handshake wins;
        // returning drops `attempts`, which cancels every attempt still in
        // flight.
        let mut attempts = FuturesUnordered::new();
        for (server, suffix) in resolved.servers {
            attempts.push(async move {
                let endpoint = Endpoint::parse(&server).map_err(TransportError::Endpoint)?;
                let mut circuit = self.dial_endpoint(&endpoint, principal, discharge_fetcher, now).await?;
                circuit.suffix = suffix;
                Ok::<DialedCircuit, TransportError>(circuit)
            });
        }

        let mut last_err = None;
        while let Some(result) = attempts.next().await {
            match result {
                Ok(circuit) => return Ok(circuit),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::ConnectionFailed(format!("no candidate servers for {name}"))))
    }

    async fn connect_with_retries(&self, addr: SocketAddr) -> Result<quinn::Connection> {
        let mut backoff = self.policy.initial_backoff;
        let mut last_err = None;
        for attempt in 0..self.policy.max_attempts {
            match self.node.connect(addr, "fabric-node").await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!(%addr, attempt, "dial attempt failed, retrying if budget remains");
                    last_err = Some(e);
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::ConnectionFailed(format!("could not dial {addr}"))))
    }

    async fn run_initiator_handshake(
        &self,
        connection: &quinn::Connection,
        target_routing_id: fabric_types::RoutingId,
        principal: &dyn Principal,
        discharge_fetcher: &dyn DischargeFetcher,
        now: u64,
    ) -> Result<HandshakeOutcome> {
        let mut flow = Flow::open_targeted(connection, target_routing_id).await?;
        handshake::run(&mut flow, Role::Initiator, principal, discharge_fetcher, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_naming::mount_table::{MountFlags, MountTable};
    use fabric_naming::resolver::{LocalMountTableService, MountTableService};
    use fabric_security::principal::LocalPrincipal;

    use crate::handshake::NoDischargeFetcher;

    #[test]
    fn default_policy_retries_a_handful_of_times() {
        let policy = DialPolicy::default();
        assert_eq!(policy.max_attempts, 3);
    }

    #[tokio::test]
    async fn connect_with_retries_gives_up_on_a_closed_port() {
        let node = Arc::new(
            QuicNode::new(crate::quic::QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() })
                .expect("test setup"),
        );
        let dialer = Dialer::new(
            node,
            DialPolicy { max_attempts: 2, initial_backoff: Duration::from_millis(1) },
        );
        // Port 1 is reserved and will refuse the connection immediately.
        let addr: SocketAddr = "127.0.0.1:1".parse().expect("valid addr");
        let result = dialer.connect_with_retries(addr).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dial_name_wins_on_the_fast_candidate_without_waiting_on_a_stalled_one() {
        let fast_server = QuicNode::new(crate::quic::QuicConfig {
            bind_addr: "127.0.0.1:0".parse().expect("valid addr"),
            ..Default::default()
        })
        .expect("test setup");
        let fast_addr = fast_server.local_addr();

        let slow_server = QuicNode::new(crate::quic::QuicConfig {
            bind_addr: "127.0.0.1:0".parse().expect("valid addr"),
            ..Default::default()
        })
        .expect("test setup");
        let slow_addr = slow_server.local_addr();

        let fast_principal = LocalPrincipal::generate();
        let slow_principal = LocalPrincipal::generate();

        // The slow candidate accepts the connection but stalls well past
        // this test's timeout before even starting the handshake flow, so
        // racing (rather than dialing sequentially) is the only way
        // `dial_name` can return before the stall elapses.
        let slow_task = tokio::spawn(async move {
            let incoming = slow_server.accept().await.expect("test setup");
            let connection = incoming.await.expect("test setup");
            tokio::time::sleep(Duration::from_secs(30)).await;
            let (mut flow, _routing_id) = Flow::accept_targeted(&connection).await.expect("test setup");
            handshake::run(&mut flow, Role::Acceptor, &slow_principal, &NoDischargeFetcher, 0).await
        });

        let fast_task = tokio::spawn(async move {
            let incoming = fast_server.accept().await.expect("test setup");
            let connection = incoming.await.expect("test setup");
            let (mut flow, _routing_id) = Flow::accept_targeted(&connection).await.expect("test setup");
            handshake::run(&mut flow, Role::Acceptor, &fast_principal, &NoDischargeFetcher, 0).await
        });

        let table = Arc::new(MountTable::new());
        let slow_endpoint = Endpoint::new("quic", slow_addr.to_string()).format().expect("format endpoint");
        let fast_endpoint = Endpoint::new("quic", fast_addr.to_string()).format().expect("format endpoint");
        // Mounted in slow-then-fast order so a naive sequential dialer would
        // try the stalled candidate first.
        table.mount("svc", &slow_endpoint, 60, 0, MountFlags::default(), &[]).expect("mount slow candidate");
        table.mount("svc", &fast_endpoint, 60, 0, MountFlags::default(), &[]).expect("mount fast candidate");

        let service: Arc<dyn MountTableService> = Arc::new(LocalMountTableService::new(table));
        let resolver = Resolver::new(vec![service]);

        let client_node = Arc::new(
            QuicNode::new(crate::quic::QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() })
                .expect("test setup"),
        );
        let dialer = Dialer::new(client_node, DialPolicy::default());
        let client_principal = LocalPrincipal::generate();

        let circuit = tokio::time::timeout(
            Duration::from_secs(5),
            dialer.dial_name(&resolver, "svc", &[], &client_principal, &NoDischargeFetcher, 0),
        )
        .await
        .expect("dial_name must return well before the stalled candidate's delay elapses")
        .expect("dial_name should succeed via the fast candidate");

        assert_eq!(circuit.connection.remote_address(), fast_addr);

        fast_task.await.expect("join").expect("fast handshake should succeed");
        slow_task.abort();
    }
}
