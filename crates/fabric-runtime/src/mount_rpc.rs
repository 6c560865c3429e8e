//! The mount-table protocol (§4.E, §6) bridged over `fabric-transport`.
//!
//! [`fabric_naming::resolver::MountTableService`] abstracts away whether a
//! mount table is reached in-process or over the wire; [`RpcMountTableClient`]
//! is the wire half, built directly on [`Call`] rather than a generic RPC
//! framework, one method per `StartCall` name, matching the six methods §6
//! names for the mount-table service. [`serve_circuit`]/[`run_server`] are
//! the matching server half, dispatching accepted calls straight at a local
//! [`MountTable`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fabric_naming::acl::AclTag;
use fabric_naming::mount_table::{GlobEntry, MountFlags, MountTable, ResolveStepResult};
use fabric_naming::resolver::{MountTableService, ServiceResolver};
use fabric_naming::NamingError;
use fabric_security::{BlessingPattern, Principal};
use fabric_transport::call::{Call, CallOptions};
use fabric_transport::dial::Dialer;
use fabric_transport::handshake::NoDischargeFetcher;
use fabric_transport::listen::{IncomingCircuit, Listener};
use fabric_transport::{Result as TransportResult, TransportError};
use fabric_types::Endpoint;

const METHOD_MOUNT: &str = "Mount";
const METHOD_UNMOUNT: &str = "Unmount";
const METHOD_RESOLVE_STEP: &str = "ResolveStep";
const METHOD_GLOB: &str = "Glob";
const METHOD_SET_PERMISSIONS: &str = "SetPermissions";
const METHOD_GET_PERMISSIONS: &str = "GetPermissions";

#[derive(Serialize, Deserialize)]
struct MountRequest {
    name: String,
    server: String,
    ttl_secs: u64,
    replace: bool,
    mt: bool,
}

#[derive(Serialize, Deserialize)]
struct UnmountRequest {
    name: String,
    server: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ResolveStepRequest {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct GlobRequest {
    pattern: String,
}

#[derive(Serialize, Deserialize)]
struct SetPermissionsRequest {
    name: String,
    acl: HashMap<AclTag, Vec<BlessingPattern>>,
    expected_version: u64,
}

#[derive(Serialize, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct PermissionsResponse {
    acl: HashMap<AclTag, Vec<BlessingPattern>>,
    version: u64,
}

fn naming_to_error(e: &NamingError) -> fabric_types::Error {
    fabric_types::Error::from_source(fabric_types::IntoFabricError::kind(e), clone_naming_error(e))
}

/// `NamingError` does not derive `Clone` (it wraps a boxed source via
/// `#[from]`); `fail` only needs its `Display` text, so render it instead of
/// cloning.
fn clone_naming_error(e: &NamingError) -> NamingError {
    NamingError::Remote(e.to_string())
}

fn transport_to_naming(e: TransportError) -> NamingError {
    NamingError::Remote(e.to_string())
}

/// A mount table reached over the wire, speaking the wire's half of §6's
/// mount-table protocol. Dials fresh for every call: simple, at the cost of
/// a handshake per call, matching this workspace's general preference for a
/// simple concurrency story over an optimized one (§5, §9).
pub struct RpcMountTableClient {
    dialer: Arc<Dialer>,
    endpoint: Endpoint,
    principal: Arc<dyn Principal>,
}

impl RpcMountTableClient {
    /// Reach the mount table published at `endpoint`, authenticating as
    /// `principal`.
    pub fn new(dialer: Arc<Dialer>, endpoint: Endpoint, principal: Arc<dyn Principal>) -> Self {
        Self { dialer, endpoint, principal }
    }

    async fn start_call(&self, method: &str, num_args: u32) -> TransportResult<Call> {
        let circuit = self
            .dialer
            .dial_endpoint(&self.endpoint, self.principal.as_ref(), &NoDischargeFetcher, 0)
            .await?;
        Call::start(&circuit.connection, self.endpoint.routing_id, method, num_args, CallOptions::default()).await
    }

    /// `Mount(server, ttl, flags) → ()`.
    pub async fn mount(&self, name: &str, server: &str, ttl_secs: u64, flags: MountFlags) -> fabric_naming::Result<()> {
        self.mount_inner(name, server, ttl_secs, flags).await.map_err(transport_to_naming)
    }

    async fn mount_inner(&self, name: &str, server: &str, ttl_secs: u64, flags: MountFlags) -> TransportResult<()> {
        let mut call = self.start_call(METHOD_MOUNT, 1).await?;
        call.send(&MountRequest {
            name: name.to_string(),
            server: server.to_string(),
            ttl_secs,
            replace: flags.replace,
            mt: flags.mt,
        })
        .await?;
        call.finish_send().await?;
        let _: Option<()> = call.recv().await?;
        call.finish().await
    }

    /// `Unmount(server) → ()`.
    pub async fn unmount(&self, name: &str, server: Option<&str>) -> fabric_naming::Result<()> {
        self.unmount_inner(name, server).await.map_err(transport_to_naming)
    }

    async fn unmount_inner(&self, name: &str, server: Option<&str>) -> TransportResult<()> {
        let mut call = self.start_call(METHOD_UNMOUNT, 1).await?;
        call.send(&UnmountRequest { name: name.to_string(), server: server.map(str::to_string) }).await?;
        call.finish_send().await?;
        let _: Option<()> = call.recv().await?;
        call.finish().await
    }

    /// `SetPermissions(acls, version) → ()`.
    pub async fn set_permissions(
        &self,
        name: &str,
        acl: HashMap<AclTag, Vec<BlessingPattern>>,
        expected_version: u64,
    ) -> fabric_naming::Result<()> {
        self.set_permissions_inner(name, acl, expected_version).await.map_err(transport_to_naming)
    }

    async fn set_permissions_inner(
        &self,
        name: &str,
        acl: HashMap<AclTag, Vec<BlessingPattern>>,
        expected_version: u64,
    ) -> TransportResult<()> {
        let mut call = self.start_call(METHOD_SET_PERMISSIONS, 1).await?;
        call.send(&SetPermissionsRequest { name: name.to_string(), acl, expected_version }).await?;
        call.finish_send().await?;
        let _: Option<()> = call.recv().await?;
        call.finish().await
    }

    /// `GetPermissions() → (acls, version)`.
    pub async fn get_permissions(&self, name: &str) -> fabric_naming::Result<(HashMap<AclTag, Vec<BlessingPattern>>, u64)> {
        self.get_permissions_inner(name).await.map_err(transport_to_naming)
    }

    async fn get_permissions_inner(&self, name: &str) -> TransportResult<(HashMap<AclTag, Vec<BlessingPattern>>, u64)> {
        let mut call = self.start_call(METHOD_GET_PERMISSIONS, 1).await?;
        call.send(&NameRequest { name: name.to_string() }).await?;
        call.finish_send().await?;
        let response: PermissionsResponse = call
            .recv()
            .await?
            .ok_or_else(|| TransportError::Protocol("GetPermissions returned no response".to_string()))?;
        call.finish().await?;
        Ok((response.acl, response.version))
    }
}

/// `caller_names` is accepted to satisfy [`MountTableService`] but not sent
/// over the wire: the names that matter for the remote table's ACL checks
/// are whatever this circuit's handshake cryptographically established for
/// `self.principal`, which the server derives itself from its own
/// [`fabric_transport::handshake::HandshakeOutcome`] rather than trusting a
/// client-asserted list.
#[async_trait]
impl MountTableService for RpcMountTableClient {
    async fn resolve_step(&self, name: &str, now: u64, _caller_names: &[String]) -> fabric_naming::Result<ResolveStepResult> {
        self.resolve_step_inner(name, now).await.map_err(transport_to_naming)
    }

    async fn glob(&self, pattern: &str, now: u64, _caller_names: Vec<String>) -> fabric_naming::Result<Vec<GlobEntry>> {
        self.glob_inner(pattern, now).await.map_err(transport_to_naming)
    }
}

impl RpcMountTableClient {
    async fn resolve_step_inner(&self, name: &str, _now: u64) -> TransportResult<ResolveStepResult> {
        let mut call = self.start_call(METHOD_RESOLVE_STEP, 1).await?;
        call.send(&ResolveStepRequest { name: name.to_string() }).await?;
        call.finish_send().await?;
        let result: ResolveStepResult = call
            .recv()
            .await?
            .ok_or_else(|| TransportError::Protocol("ResolveStep returned no response".to_string()))?;
        call.finish().await?;
        Ok(result)
    }

    async fn glob_inner(&self, pattern: &str, _now: u64) -> TransportResult<Vec<GlobEntry>> {
        let mut call = self.start_call(METHOD_GLOB, 1).await?;
        call.send(&GlobRequest { pattern: pattern.to_string() }).await?;
        call.finish_send().await?;
        let mut entries = Vec::new();
        while let Some(entry) = call.recv::<GlobEntry>().await? {
            entries.push(entry);
        }
        call.finish().await?;
        Ok(entries)
    }
}

/// Lets [`fabric_naming::resolver::Resolver`] cross from one mount table to
/// another it never had wired up as a root, by parsing a mount's server
/// string as an [`Endpoint`] and dialing it fresh. This is what makes
/// federated resolution (§4.E, §8 scenario 2) actually reach a dynamically
/// discovered remote mount table rather than only ones supplied up front.
pub struct RpcServiceResolver {
    dialer: Arc<Dialer>,
    principal: Arc<dyn Principal>,
}

impl RpcServiceResolver {
    /// Dial redirected-to endpoints using `dialer`, authenticating as `principal`.
    pub fn new(dialer: Arc<Dialer>, principal: Arc<dyn Principal>) -> Self {
        Self { dialer, principal }
    }
}

#[async_trait]
impl ServiceResolver for RpcServiceResolver {
    async fn service_for(&self, server: &str) -> fabric_naming::Result<Arc<dyn MountTableService>> {
        let endpoint = Endpoint::parse(server).map_err(|e| NamingError::Remote(e.to_string()))?;
        let client = RpcMountTableClient::new(Arc::clone(&self.dialer), endpoint, Arc::clone(&self.principal));
        Ok(Arc::new(client))
    }
}

/// Serve every call on an already-accepted circuit against `table`, until
/// the peer closes the connection. The caller's identity for each call's ACL
/// checks comes from `circuit.handshake` — the cryptographically verified
/// outcome of this circuit's mutual handshake — never from the request body.
pub async fn serve_circuit(circuit: &IncomingCircuit, table: &MountTable, now: u64) -> TransportResult<()> {
    loop {
        let (mut call, info) = match Call::accept(&circuit.connection).await {
            Ok(v) => v,
            Err(TransportError::ConnectionFailed(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Err(e) = dispatch(&mut call, &info.method, table, &circuit.handshake, now).await {
            call.fail(&e).await?;
        }
    }
}

async fn dispatch(
    call: &mut Call,
    method: &str,
    table: &MountTable,
    handshake: &fabric_transport::handshake::HandshakeOutcome,
    now: u64,
) -> Result<(), fabric_types::Error> {
    call.accept_call().await.map_err(transport_err)?;
    let caller_names = handshake.peer_approved_names_for(method, &[], now, &[]);
    match method {
        METHOD_MOUNT => {
            let request: MountRequest = recv_required(call).await?;
            table
                .mount(
                    &request.name,
                    &request.server,
                    request.ttl_secs,
                    now,
                    MountFlags { replace: request.replace, mt: request.mt },
                    &caller_names,
                )
                .map_err(|e| naming_to_error(&e))?;
            send_unit(call).await
        }
        METHOD_UNMOUNT => {
            let request: UnmountRequest = recv_required(call).await?;
            table
                .unmount(&request.name, request.server.as_deref(), &caller_names)
                .map_err(|e| naming_to_error(&e))?;
            send_unit(call).await
        }
        METHOD_RESOLVE_STEP => {
            let request: ResolveStepRequest = recv_required(call).await?;
            let result = table
                .resolve_step(&request.name, now, &caller_names)
                .map_err(|e| naming_to_error(&e))?;
            call.send(&result).await.map_err(transport_err)?;
            finish(call).await
        }
        METHOD_GLOB => {
            let request: GlobRequest = recv_required(call).await?;
            let mut rx = table.glob(&request.pattern, now, caller_names);
            while let Some(entry) = rx.recv().await {
                call.send(&entry).await.map_err(transport_err)?;
            }
            finish(call).await
        }
        METHOD_SET_PERMISSIONS => {
            let request: SetPermissionsRequest = recv_required(call).await?;
            table
                .set_permissions(&request.name, request.acl, request.expected_version, &caller_names)
                .map_err(|e| naming_to_error(&e))?;
            send_unit(call).await
        }
        METHOD_GET_PERMISSIONS => {
            let request: NameRequest = recv_required(call).await?;
            let (acl, version) = table.permissions(&request.name);
            call.send(&PermissionsResponse { acl, version }).await.map_err(transport_err)?;
            finish(call).await
        }
        other => Err(fabric_types::Error::new(
            fabric_types::ErrorKind::Internal,
            format!("mount table does not serve method {other}"),
        )),
    }
}

async fn recv_required<T: for<'de> Deserialize<'de>>(call: &mut Call) -> Result<T, fabric_types::Error> {
    call.recv::<T>()
        .await
        .map_err(transport_err)?
        .ok_or_else(|| fabric_types::Error::new(fabric_types::ErrorKind::Internal, "request had no body"))
}

async fn send_unit(call: &mut Call) -> Result<(), fabric_types::Error> {
    call.send(&()).await.map_err(transport_err)?;
    finish(call).await
}

async fn finish(call: &mut Call) -> Result<(), fabric_types::Error> {
    call.finish_send().await.map_err(transport_err)
}

fn transport_err(e: TransportError) -> fabric_types::Error {
    fabric_types::Error::from_source(fabric_types::IntoFabricError::kind(&e), e)
}

/// Runs a mount-table server forever over `listener`, each accepted circuit
/// served on its own task against the shared `table`.
pub async fn run_server(
    listener: Listener,
    table: Arc<MountTable>,
    principal: Arc<dyn Principal>,
    now_fn: fn() -> u64,
) -> TransportResult<()> {
    loop {
        let circuit = listener.accept_circuit(principal.as_ref(), &NoDischargeFetcher, now_fn()).await?;
        let table = Arc::clone(&table);
        tokio::spawn(async move {
            if let Err(e) = serve_circuit(&circuit, &table, now_fn()).await {
                tracing::warn!(error = %e, "mount table circuit ended with an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_security::principal::LocalPrincipal;
    use fabric_transport::dial::DialPolicy;
    use fabric_transport::listen::ListenSpec;
    use fabric_transport::quic::{QuicConfig, QuicNode};

    #[tokio::test]
    async fn a_remote_client_mounts_and_resolves_through_a_real_server() {
        use fabric_crypto::ed25519::SigningKey;
        use fabric_security::roots::BlessingRoots;
        use fabric_security::store::InMemoryBlessingStore;
        use fabric_security::BlessingPattern;

        let server_key = SigningKey::generate();
        let client_key = SigningKey::generate();

        let server_roots = BlessingRoots::new();
        server_roots.add(client_key.verifying_key(), BlessingPattern::all());
        let server_principal: Arc<dyn Principal> =
            Arc::new(LocalPrincipal::with_roots(server_key.clone(), InMemoryBlessingStore::new(), server_roots));
        server_principal
            .blessing_store()
            .set_default(server_principal.bless_self("server", vec![]))
            .expect("test setup");

        let client_roots = BlessingRoots::new();
        client_roots.add(server_key.verifying_key(), BlessingPattern::all());
        let client_principal: Arc<dyn Principal> =
            Arc::new(LocalPrincipal::with_roots(client_key.clone(), InMemoryBlessingStore::new(), client_roots));
        client_principal
            .blessing_store()
            .set_default(client_principal.bless_self("client", vec![]))
            .expect("test setup");

        let routing_id = fabric_types::RoutingId::generate();
        let table = Arc::new(MountTable::new());

        let listener = Listener::bind(
            ListenSpec { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() },
            routing_id,
        )
        .await
        .expect("test setup");
        let endpoint = listener.published_endpoint(true, Vec::new());

        let server_table = Arc::clone(&table);
        let server_principal_for_task = Arc::clone(&server_principal);
        tokio::spawn(async move {
            let _ = run_server(listener, server_table, server_principal_for_task, || 0).await;
        });

        let node = Arc::new(QuicNode::new(QuicConfig { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() }).expect("test setup"));
        let dialer = Arc::new(Dialer::new(node, DialPolicy::default()));
        let client = RpcMountTableClient::new(dialer, endpoint, client_principal);

        client.mount("svc", "@5@quic@127.0.0.1:1234@00000000000000000000000000000000@0@@@", 60, MountFlags::default()).await.expect("test setup");

        let result = client.resolve_step("svc", 0, &[]).await.expect("test setup");
        assert_eq!(result.servers, vec!["@5@quic@127.0.0.1:1234@00000000000000000000000000000000@0@@@".to_string()]);
        assert_eq!(result.suffix, "");
    }
}
