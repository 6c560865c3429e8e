//! The out-of-process key custodian (§4.H).
//!
//! [`KeyManager`] owns zero or more [`fabric_security::LocalPrincipal`]s in
//! this process's memory and exposes each one, individually, on its own Unix
//! socket. A client never sees another principal's key material; the socket
//! a client connects to *is* its authorization to act as that principal
//! (the same model `ssh-agent` uses for `SSH_AUTH_SOCK`).
//!
//! Mutating operations (`Bless`, `BlessingStoreSet`, `BlessingStoreSetDefault`,
//! `RootsAdd`) are serialized per principal by routing every connection's
//! dispatch through that principal's [`ServedPrincipal`], which holds the
//! principal behind a single `Mutex`; reads (`PublicKey`, `Sign`,
//! `BlessingStoreForPeer`, `BlessingStoreDefault`, `RootsExport`) do not need
//! the lock held across any I/O, so callers never block on one another for
//! longer than the operation itself takes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use fabric_security::principal::LocalPrincipal;
use fabric_security::roots::BlessingRoots;
use fabric_security::store::InMemoryBlessingStore;
use fabric_security::Principal;

use crate::protocol::{read_framed_async, write_framed_async, Request, Response};
use crate::AgentError;

/// An opaque reference to one principal held by a [`KeyManager`]. Not
/// forgeable from outside the process: the only way to learn one is to mint
/// it yourself via [`KeyManager::new_principal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrincipalHandle(u64);

struct ServedPrincipal {
    principal: Mutex<LocalPrincipal<InMemoryBlessingStore>>,
    generation: watch::Sender<u64>,
}

impl ServedPrincipal {
    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// Owns every principal this agent process has minted, each reachable only
/// through the socket it was explicitly served on.
#[derive(Default)]
pub struct KeyManager {
    next_handle: AtomicU64,
    principals: Mutex<HashMap<PrincipalHandle, Arc<ServedPrincipal>>>,
}

impl KeyManager {
    /// A fresh, empty key manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh principal with a random key and an empty blessing store
    /// and root set, returning a handle to it. The key never leaves this
    /// process.
    pub fn new_principal(&self) -> PrincipalHandle {
        let handle = PrincipalHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, _rx) = watch::channel(0u64);
        let served = ServedPrincipal {
            principal: Mutex::new(LocalPrincipal::generate()),
            generation: tx,
        };
        self.principals.lock().expect("key manager lock poisoned").insert(handle, Arc::new(served));
        handle
    }

    /// Mint a principal from an already-loaded key, store, and root set
    /// (e.g. read from a [`fabric_security::persistence::CredentialsDir`]).
    pub fn import_principal(
        &self,
        signing_key: fabric_crypto::ed25519::SigningKey,
        store: InMemoryBlessingStore,
        roots: BlessingRoots,
    ) -> PrincipalHandle {
        let handle = PrincipalHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, _rx) = watch::channel(0u64);
        let served = ServedPrincipal {
            principal: Mutex::new(LocalPrincipal::with_roots(signing_key, store, roots)),
            generation: tx,
        };
        self.principals.lock().expect("key manager lock poisoned").insert(handle, Arc::new(served));
        handle
    }

    /// Expose `handle`'s principal on a freshly bound Unix socket at
    /// `socket_path`, serving connections forever. The socket's permissions
    /// are restricted to the current user (§6). Returns once the listener
    /// fails to bind; a successful bind runs until the process is killed or
    /// the returned future is dropped.
    pub async fn serve_principal(&self, handle: PrincipalHandle, socket_path: &Path) -> Result<(), AgentError> {
        let served = self
            .principals
            .lock()
            .expect("key manager lock poisoned")
            .get(&handle)
            .cloned()
            .ok_or(AgentError::UnknownPrincipal)?;

        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path).map_err(|e| AgentError::Io(e.to_string()))?;
        restrict_permissions(socket_path)?;

        tracing::info!(path = %socket_path.display(), "agent socket listening");
        loop {
            let (stream, _addr) = listener.accept().await.map_err(|e| AgentError::Io(e.to_string()))?;
            let served = Arc::clone(&served);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(served, stream).await {
                    tracing::warn!(error = %e, "agent connection ended with an error");
                }
            });
        }
    }
}

async fn serve_connection(served: Arc<ServedPrincipal>, mut stream: UnixStream) -> Result<(), AgentError> {
    loop {
        let request: Request = match read_framed_async(&mut stream).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(AgentError::Io(e.to_string())),
        };
        let response = handle_request(&served, request).await;
        write_framed_async(&mut stream, &response).await.map_err(|e| AgentError::Io(e.to_string()))?;
    }
}

async fn handle_request(served: &Arc<ServedPrincipal>, request: Request) -> Response {
    let served = Arc::clone(served);
    // Every request body is a handful of signatures/blessings at most;
    // running the handler on a blocking thread keeps a slow client from
    // holding this connection's task hostage, matching the "one in-flight
    // signing operation per private key at a time" policy via the principal
    // mutex rather than via the async runtime.
    tokio::task::spawn_blocking(move || dispatch(&served, request))
        .await
        .unwrap_or_else(|e| Response::Error { message: format!("agent worker panicked: {e}") })
}

fn dispatch(served: &ServedPrincipal, request: Request) -> Response {
    let principal = served.principal.lock().expect("principal lock poisoned");
    match request {
        Request::PublicKey => Response::PublicKey { key: principal.public_key() },
        Request::Sign { message } => Response::Signature { signature: principal.sign(&message) },
        Request::BlessSelf { name, caveats } => Response::Blessings { blessings: principal.bless_self(&name, caveats) },
        Request::Bless { target_key, with, extension, caveat, extra_caveats } => {
            match principal.bless(target_key, &with, &extension, caveat, extra_caveats) {
                Ok(blessings) => Response::Blessings { blessings },
                Err(e) => Response::BlessFailed { reason: e.to_string() },
            }
        }
        Request::BlessingStoreSet { blessings, pattern } => match principal.blessing_store().set(blessings, pattern) {
            Ok(previous) => {
                drop(principal);
                served.bump();
                Response::Blessings { blessings: previous }
            }
            Err(e) => Response::Error { message: e.to_string() },
        },
        Request::BlessingStoreForPeer { peer_blessing_names } => {
            Response::Blessings { blessings: principal.blessing_store().for_peer(&peer_blessing_names) }
        }
        Request::BlessingStoreDefault => Response::Blessings { blessings: principal.blessing_store().default_blessings() },
        Request::BlessingStoreSetDefault { blessings } => match principal.blessing_store().set_default(blessings) {
            Ok(()) => {
                drop(principal);
                served.bump();
                Response::Unit
            }
            Err(e) => Response::Error { message: e.to_string() },
        },
        Request::RootsExport => Response::RootsExport { entries: principal.roots().export() },
        Request::RootsAdd { key, pattern } => {
            principal.roots().add(key, pattern);
            drop(principal);
            served.bump();
            Response::Unit
        }
        Request::NotifyWhenChanged { after_generation } => {
            // Long-polling inside a blocking-pool task: acceptable here
            // because each connection's requests are handled one at a time
            // anyway (the protocol has no pipelining), so this thread would
            // otherwise sit idle until the next request regardless.
            let mut rx = served.generation.subscribe();
            let current = *rx.borrow();
            if current > after_generation {
                return Response::Generation { value: current };
            }
            let handle = tokio::runtime::Handle::current();
            loop {
                if handle.block_on(rx.changed()).is_err() {
                    return Response::Generation { value: current };
                }
                let value = *rx.borrow();
                if value > after_generation {
                    return Response::Generation { value };
                }
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).map_err(|e| AgentError::Io(e.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), AgentError> {
    Ok(())
}
