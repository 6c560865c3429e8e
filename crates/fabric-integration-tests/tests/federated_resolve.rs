//! Integration test: federated resolution across two real mount-table
//! servers (spec scenario 2).
//!
//! Mount table M1 mounts M2 at "x" with the MT flag; M2 has a server
//! mounted at "y/z". Resolving "x/y/z" against M1 over a real loopback QUIC
//! connection must cross to M2 and return M2's terminal server for "y/z",
//! never the intermediate mount M1 itself.

use std::sync::Arc;

use fabric_naming::mount_table::{MountFlags, MountTable};
use fabric_naming::resolver::{MountTableService, Resolver};
use fabric_security::principal::LocalPrincipal;
use fabric_security::roots::BlessingRoots;
use fabric_security::store::InMemoryBlessingStore;
use fabric_security::{BlessingPattern, Principal};
use fabric_transport::dial::{DialPolicy, Dialer};
use fabric_transport::listen::{Listener, ListenSpec};
use fabric_transport::quic::{QuicConfig, QuicNode};
use fabric_runtime::mount_rpc::{run_server, RpcMountTableClient, RpcServiceResolver};

const NOBODY: &[String] = &[];

fn fresh_principal(name: &str) -> Arc<dyn Principal> {
    let p = LocalPrincipal::with_roots(
        fabric_crypto::ed25519::SigningKey::generate(),
        InMemoryBlessingStore::new(),
        BlessingRoots::new(),
    );
    p.blessing_store().set_default(p.bless_self(name, vec![])).expect("set default");
    Arc::new(p)
}

/// Every node in this fixture is "us", so just have each pair trust the
/// other's key outright rather than modeling a shared root of trust.
fn link_mutual_trust(a: &dyn Principal, b: &dyn Principal) {
    a.roots().add(b.public_key(), BlessingPattern::all());
    b.roots().add(a.public_key(), BlessingPattern::all());
}

/// Bind a mount-table server on a fresh loopback port, seed its table, and
/// serve it forever on a background task. Returns the endpoint other nodes
/// should dial to reach it.
async fn start_mount_table_server(
    principal: Arc<dyn Principal>,
    seed: impl FnOnce(&MountTable),
) -> fabric_types::Endpoint {
    let table = Arc::new(MountTable::new());
    seed(&table);

    let routing_id = fabric_types::RoutingId::generate();
    let listener = Listener::bind(
        ListenSpec { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() },
        routing_id,
    )
    .await
    .unwrap();
    let endpoint = listener.published_endpoint(true, Vec::new());

    tokio::spawn(async move {
        let _ = run_server(listener, table, principal, || 0).await;
    });
    endpoint
}

#[tokio::test]
#[ignore]
async fn resolving_through_a_mounted_remote_mount_table_reaches_its_terminal_server() {
    let m1_principal = fresh_principal("m1");
    let m2_principal = fresh_principal("m2");
    let client_principal = fresh_principal("client");
    link_mutual_trust(m1_principal.as_ref(), client_principal.as_ref());
    link_mutual_trust(m2_principal.as_ref(), client_principal.as_ref());

    // M2 has a real terminal server mounted at "y/z".
    let m2_endpoint = start_mount_table_server(Arc::clone(&m2_principal), |table| {
        table
            .mount("y/z", "tcp:127.0.0.1:9999", 3600, 0, MountFlags::default(), NOBODY)
            .expect("mount y/z on m2");
    })
    .await;

    // M1 mounts M2 at "x" with the MT flag, so a resolver knows to recurse
    // into it rather than treat it as a terminal server.
    let m2_location = m2_endpoint.format().expect("format m2 endpoint");
    let m1_endpoint = start_mount_table_server(Arc::clone(&m1_principal), |table| {
        table
            .mount("x", &m2_location, 3600, 0, MountFlags { replace: false, mt: true }, NOBODY)
            .expect("mount m2 under m1 at x");
    })
    .await;

    let node = Arc::new(QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() }).unwrap());
    let dialer = Arc::new(Dialer::new(node, DialPolicy::default()));
    let m1_client = RpcMountTableClient::new(Arc::clone(&dialer), m1_endpoint, Arc::clone(&client_principal));

    // M1's mount of "x" only gives us M2's address, never an already-dialed
    // client for it; the resolver needs a service resolver to actually reach
    // M2 once it crosses that redirect.
    let roots: Vec<Arc<dyn MountTableService>> = vec![Arc::new(m1_client)];
    let service_resolver = Arc::new(RpcServiceResolver::new(Arc::clone(&dialer), Arc::clone(&client_principal)));
    let resolver = Resolver::new(roots).with_service_resolver(service_resolver);
    let resolved = resolver.resolve("x/y/z", 0, &[]).await.expect("federated resolve");

    assert_eq!(resolved.servers.len(), 1);
    let (server, suffix) = &resolved.servers[0];
    assert_eq!(server, "tcp:127.0.0.1:9999", "resolution must reach m2's terminal server, not m1's mount of m2");
    assert_eq!(suffix, "");
}
