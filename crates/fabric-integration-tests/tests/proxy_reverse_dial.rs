//! Integration test: reverse-dial proxy (spec scenario 6).
//!
//! A server behind a NAT registers with a `ProxyRelay` instead of binding a
//! reachable listen address. A client dials the relay's address, never the
//! server's, and still completes a real mutually-authenticated handshake and
//! call through the splice.

use std::net::SocketAddr;
use std::sync::Arc;

use fabric_security::principal::LocalPrincipal;
use fabric_security::roots::BlessingRoots;
use fabric_security::store::InMemoryBlessingStore;
use fabric_security::{BlessingPattern, Principal};
use fabric_transport::call::{Call, CallOptions};
use fabric_transport::dial::{DialPolicy, Dialer};
use fabric_transport::handshake::NoDischargeFetcher;
use fabric_transport::listen::{Listener, ListenSpec};
use fabric_transport::proxy::ProxyRelay;
use fabric_transport::quic::{QuicConfig, QuicNode};

fn fresh_principal(name: &str) -> Arc<dyn Principal> {
    let p = LocalPrincipal::with_roots(
        fabric_crypto::ed25519::SigningKey::generate(),
        InMemoryBlessingStore::new(),
        BlessingRoots::new(),
    );
    p.blessing_store().set_default(p.bless_self(name, vec![])).expect("set default");
    Arc::new(p)
}

fn link_mutual_trust(a: &dyn Principal, b: &dyn Principal) {
    a.roots().add(b.public_key(), BlessingPattern::all());
    b.roots().add(a.public_key(), BlessingPattern::all());
}

#[tokio::test]
#[ignore]
async fn a_client_reaches_a_proxied_server_that_never_accepted_an_inbound_connection() {
    let relay = Arc::new(ProxyRelay::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() }).unwrap());
    let relay_addr = relay.local_addr();
    tokio::spawn(Arc::clone(&relay).serve());

    let server_principal = fresh_principal("server");
    let client_principal = fresh_principal("client");
    link_mutual_trust(server_principal.as_ref(), client_principal.as_ref());

    let routing_id = fabric_types::RoutingId::generate();
    let listener = Listener::bind(
        ListenSpec { bind_addr: "127.0.0.1:0".parse().unwrap(), protocol: "quic".to_string(), proxy: Some(relay_addr) },
        routing_id,
    )
    .await
    .unwrap();

    // Published address is the relay's, never the server's own ephemeral port.
    let endpoint = listener.published_endpoint(false, Vec::new());
    assert_eq!(endpoint.address, relay_addr.to_string(), "clients must dial the relay, not the server directly");

    let server_task = tokio::spawn(async move {
        let circuit = listener.accept_circuit(server_principal.as_ref(), &NoDischargeFetcher, 0).await.unwrap();
        let (mut call, info) = Call::accept(&circuit.connection).await.unwrap();
        assert_eq!(info.method, "Ping");
        call.accept_call().await.unwrap();
        assert!(call.recv::<()>().await.unwrap().is_none());
        call.send(&"pong".to_string()).await.unwrap();
        call.finish().await.unwrap();
    });

    let node = Arc::new(QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() }).unwrap());
    let dialer = Dialer::new(node, DialPolicy::default());
    let circuit = dialer
        .dial_endpoint(&endpoint, client_principal.as_ref(), &NoDischargeFetcher, 0)
        .await
        .expect("dial through the relay succeeds");

    // The connection the client actually holds is to the relay's socket, not
    // a direct connection to the server — there is no other address it
    // could have dialed.
    let peer: SocketAddr = circuit.connection.remote_address();
    assert_eq!(peer, relay_addr);

    let mut call = Call::start(&circuit.connection, routing_id, "Ping", 0, CallOptions::default()).await.unwrap();
    call.finish_send().await.unwrap();
    let reply: String = call.recv().await.unwrap().unwrap();
    assert_eq!(reply, "pong");

    server_task.await.unwrap();
}
