//! The client side of the agent protocol: an agent-backed [`Principal`]
//! implementation that never sees its own private key (§4.H, §9).
//!
//! [`Principal`]'s methods are synchronous (the handshake and blessing code
//! they are called from is not always inside an async context convenient to
//! await from), so [`AgentPrincipal`] talks to the agent over a blocking
//! `std::os::unix::net::UnixStream` rather than a tokio one, matching the
//! synchronous shape the trait already commits callers to. One connection is
//! kept open and reused, guarded by a mutex so concurrent callers serialize
//! rather than racing frames on the wire.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fabric_crypto::ed25519::{Signature, VerifyingKey};
use fabric_security::blessings::Blessings;
use fabric_security::caveat::Caveat;
use fabric_security::discharge::DischargeCache;
use fabric_security::pattern::BlessingPattern;
use fabric_security::roots::BlessingRoots;
use fabric_security::store::BlessingStore;
use fabric_security::{Principal, SecurityError};

use crate::protocol::{read_framed, write_framed, Request, Response};
use crate::AgentError;

struct Connection {
    socket_path: PathBuf,
    stream: Mutex<UnixStream>,
}

impl Connection {
    fn connect(socket_path: &Path) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(socket_path).map_err(|e| AgentError::Io(e.to_string()))?;
        Ok(Self { socket_path: socket_path.to_path_buf(), stream: Mutex::new(stream) })
    }

    fn roundtrip(&self, request: &Request) -> Result<Response, AgentError> {
        let mut stream = self.stream.lock().expect("agent connection lock poisoned");
        if let Err(e) = write_framed(&mut *stream, request) {
            *stream = reconnect(&self.socket_path)?;
            write_framed(&mut *stream, request).map_err(|e2| AgentError::Io(format!("{e}; retry failed: {e2}")))?;
        }
        read_framed(&mut *stream).map_err(|e| AgentError::Io(e.to_string()))
    }

    /// Round-trip `request` and pick the one [`Response`] variant the
    /// caller can do something with out of it, via `extract`.
    ///
    /// [`Principal`]'s non-fallible methods (`sign`, `bless_self`, …) give
    /// this no `Result` to report a dead agent connection or a malformed
    /// reply through; those are genuine invariant violations (the agent
    /// process died, or sent a reply shape this client has never seen), not
    /// recoverable application errors, so this surfaces them the same way
    /// the rest of the workspace surfaces a poisoned lock: a descriptive
    /// `expect`.
    fn call<T>(&self, method: &'static str, request: Request, extract: impl FnOnce(Response) -> Option<T>) -> T {
        let response = self.roundtrip(&request).expect("agent connection failed");
        extract(response).expect(method)
    }
}

fn reconnect(socket_path: &Path) -> Result<UnixStream, AgentError> {
    UnixStream::connect(socket_path).map_err(|e| AgentError::Io(e.to_string()))
}

/// A [`Principal`] whose private key lives in a separate agent process,
/// reached over a Unix socket.
pub struct AgentPrincipal {
    conn: Arc<Connection>,
    public_key: VerifyingKey,
    store: AgentBlessingStore,
    roots: BlessingRoots,
}

impl AgentPrincipal {
    /// Connect to the agent socket at `socket_path`, which must already be
    /// serving exactly one principal (see [`crate::server::KeyManager::serve_principal`]).
    ///
    /// Fetches the public key and a snapshot of the trusted root set once,
    /// up front: `PublicKey` never changes for a given principal, and
    /// `BlessingRoots`'s API returns an owned `&BlessingRoots` rather than a
    /// remote handle, so there is no way to intercept a later direct
    /// `.add()` call on it and forward it to the agent. Root sets are
    /// ordinarily provisioned once when a principal is created, so this
    /// snapshot-at-connect is the only round trip `roots()` ever needs; a
    /// deployment that adds roots to a live agent-backed principal after
    /// this snapshot is taken must reconnect to observe them (documented as
    /// a resolved open question in DESIGN.md).
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let conn = Arc::new(Connection::connect(socket_path.as_ref())?);

        let public_key = match conn.roundtrip(&Request::PublicKey)? {
            Response::PublicKey { key } => key,
            other => return Err(unexpected(other)),
        };

        let roots = match conn.roundtrip(&Request::RootsExport)? {
            Response::RootsExport { entries } => BlessingRoots::import(entries),
            other => return Err(unexpected(other)),
        };

        Ok(Self {
            store: AgentBlessingStore {
                conn: Arc::clone(&conn),
                cached_default: RwLock::new(None),
                generation_seen: AtomicU64::new(0),
                discharges: DischargeCache::new(),
            },
            conn,
            public_key,
            roots,
        })
    }
}

impl Principal for AgentPrincipal {
    fn public_key(&self) -> VerifyingKey {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.conn.call("Sign", Request::Sign { message: message.to_vec() }, |r| match r {
            Response::Signature { signature } => Some(signature),
            _ => None,
        })
    }

    fn bless_self(&self, name: &str, caveats: Vec<Caveat>) -> Blessings {
        self.conn.call("BlessSelf", Request::BlessSelf { name: name.to_string(), caveats }, |r| match r {
            Response::Blessings { blessings } => Some(blessings),
            _ => None,
        })
    }

    fn bless(
        &self,
        target_key: VerifyingKey,
        with: &Blessings,
        extension: &str,
        caveat: Caveat,
        extra_caveats: Vec<Caveat>,
    ) -> fabric_security::Result<Blessings> {
        let request = Request::Bless {
            target_key,
            with: with.clone(),
            extension: extension.to_string(),
            caveat,
            extra_caveats,
        };
        match self.conn.roundtrip(&request).expect("agent connection failed") {
            Response::Blessings { blessings } => Ok(blessings),
            Response::BlessFailed { .. } => Err(SecurityError::PublicKeyMismatch),
            other => unreachable!("Bless: unexpected agent response {other:?}"),
        }
    }

    fn blessing_store(&self) -> &dyn BlessingStore {
        &self.store
    }

    fn roots(&self) -> &BlessingRoots {
        &self.roots
    }
}

/// A [`BlessingStore`] that proxies every call to the agent over its
/// connection, with `default_blessings` cached locally and invalidated by
/// polling the agent's mutation generation counter (§4.H's `NotifyWhenChanged`).
struct AgentBlessingStore {
    conn: Arc<Connection>,
    cached_default: RwLock<Option<Blessings>>,
    generation_seen: AtomicU64,
    discharges: DischargeCache,
}

impl AgentBlessingStore {
    fn refresh_if_changed(&self) {
        let Ok(Response::Generation { value }) = self.conn.roundtrip(&Request::NotifyWhenChanged {
            after_generation: self.generation_seen.load(Ordering::Acquire),
        }) else {
            return;
        };
        if value > self.generation_seen.swap(value, Ordering::AcqRel) {
            *self.cached_default.write().expect("agent cache lock poisoned") = None;
        }
    }
}

impl BlessingStore for AgentBlessingStore {
    fn set(&self, blessings: Blessings, pattern: BlessingPattern) -> fabric_security::Result<Blessings> {
        match self.conn.roundtrip(&Request::BlessingStoreSet { blessings, pattern }).expect("agent connection failed") {
            Response::Blessings { blessings } => Ok(blessings),
            Response::Error { message } => Err(SecurityError::Persistence(message)),
            other => unreachable!("BlessingStoreSet: unexpected agent response {other:?}"),
        }
    }

    fn for_peer(&self, peer_blessing_names: &[String]) -> Blessings {
        self.conn.call(
            "BlessingStoreForPeer",
            Request::BlessingStoreForPeer { peer_blessing_names: peer_blessing_names.to_vec() },
            |r| match r {
                Response::Blessings { blessings } => Some(blessings),
                _ => None,
            },
        )
    }

    fn default_blessings(&self) -> Blessings {
        if let Some(cached) = self.cached_default.read().expect("agent cache lock poisoned").clone() {
            return cached;
        }
        let blessings = self.conn.call("BlessingStoreDefault", Request::BlessingStoreDefault, |r| match r {
            Response::Blessings { blessings } => Some(blessings),
            _ => None,
        });
        *self.cached_default.write().expect("agent cache lock poisoned") = Some(blessings.clone());
        blessings
    }

    fn set_default(&self, blessings: Blessings) -> fabric_security::Result<()> {
        match self
            .conn
            .roundtrip(&Request::BlessingStoreSetDefault { blessings: blessings.clone() })
            .expect("agent connection failed")
        {
            Response::Unit => {
                *self.cached_default.write().expect("agent cache lock poisoned") = Some(blessings);
                self.refresh_if_changed();
                Ok(())
            }
            Response::Error { message } => Err(SecurityError::Persistence(message)),
            other => unreachable!("BlessingStoreSetDefault: unexpected agent response {other:?}"),
        }
    }

    fn discharge_cache(&self) -> &DischargeCache {
        &self.discharges
    }
}

fn unexpected(response: Response) -> AgentError {
    AgentError::Protocol(format!("unexpected agent response: {response:?}"))
}
