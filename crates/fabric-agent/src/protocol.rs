//! The wire protocol spoken over an agent's Unix socket (§4.H, §6).
//!
//! One socket serves exactly one principal (multiplexing many principals
//! across a single agent process means binding one socket per principal via
//! [`crate::server::KeyManager::serve_principal`], not multiplexing requests
//! on a shared socket). Frames are CBOR-encoded and length-prefixed with the
//! same `[len:4 LE][bytes]` wire shape `fabric-transport` uses for QUIC
//! streams, kept here rather than shared so this crate does not have to
//! depend on the transport crate for a four-line framing routine.

use std::io;

use serde::{Deserialize, Serialize};

use fabric_crypto::ed25519::{Signature, VerifyingKey};
use fabric_security::{BlessingPattern, Blessings, Caveat};

/// Frames larger than this close the connection (§6: "oversize requests
/// close the connection").
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// A request sent to the agent over its socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// `PublicKey()`.
    PublicKey,
    /// `Sign(bytes)`.
    Sign { message: Vec<u8> },
    /// `BlessSelf(name, caveats)`.
    BlessSelf { name: String, caveats: Vec<Caveat> },
    /// `Bless(target_key, with, extension, caveat, extra_caveats)`.
    Bless {
        target_key: VerifyingKey,
        with: Blessings,
        extension: String,
        caveat: Caveat,
        extra_caveats: Vec<Caveat>,
    },
    /// `BlessingStoreSet(blessings, pattern)`.
    BlessingStoreSet { blessings: Blessings, pattern: BlessingPattern },
    /// `BlessingStoreForPeer(peer_blessing_names)`.
    BlessingStoreForPeer { peer_blessing_names: Vec<String> },
    /// `BlessingStoreDefault()`.
    BlessingStoreDefault,
    /// `BlessingStoreSetDefault(blessings)`.
    BlessingStoreSetDefault { blessings: Blessings },
    /// `RootsExport()` — a snapshot of the trusted root set, used to
    /// initialize an agent-backed principal's local mirror at connect time.
    RootsExport,
    /// `RootsAdd(key, pattern)`.
    RootsAdd { key: VerifyingKey, pattern: BlessingPattern },
    /// `NotifyWhenChanged(after_generation)` — long-polls until the agent's
    /// mutation generation counter exceeds `after_generation`, then returns
    /// the new value. Never returns an error from a timeout; the caller is
    /// expected to re-issue it.
    NotifyWhenChanged { after_generation: u64 },
}

/// The agent's reply to a [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    PublicKey { key: VerifyingKey },
    Signature { signature: Signature },
    Blessings { blessings: Blessings },
    /// `Bless` failed because `with` was not bound to this principal's key.
    BlessFailed { reason: String },
    RootsExport { entries: Vec<(VerifyingKey, Vec<BlessingPattern>)> },
    Generation { value: u64 },
    Unit,
    /// A mutating call landed on an immutable store, or any other
    /// unexpected server-side failure.
    Error { message: String },
}

/// Write a length-prefixed CBOR-encoded value to a blocking writer.
pub fn write_framed<W: io::Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let len = u32::try_from(buf.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read a length-prefixed CBOR-encoded value from a blocking reader.
pub fn read_framed<R: io::Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame length {len} exceeds maximum {MAX_FRAME_SIZE}")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    ciborium::from_reader(buf.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Write a length-prefixed CBOR-encoded value to an async writer.
pub async fn write_framed_async<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let len = u32::try_from(buf.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read a length-prefixed CBOR-encoded value from an async reader.
pub async fn read_framed_async<R, T>(reader: &mut R) -> io::Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    use tokio::io::AsyncReadExt;
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame length {len} exceeds maximum {MAX_FRAME_SIZE}")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    ciborium::from_reader(buf.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
