//! QUIC/TLS 1.3 connection management (component F's reliable-byte-transport
//! substrate).
//!
//! TLS 1.3 via a self-signed certificate provides transport encryption only;
//! peer authentication is the job of the blessing handshake in
//! [`crate::handshake`], which runs over the first flow a circuit opens.
//! Accepting any server certificate here is intentional, not an oversight.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::TransportError;

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams per
/// connection (one per open flow).
pub const DEFAULT_MAX_BI_STREAMS: u32 = 256;

/// Configuration for a [`QuicNode`].
#[derive(Clone)]
pub struct QuicConfig {
    /// Local address to bind to. `0.0.0.0:0` picks an OS-assigned port.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// A QUIC node that both listens for and initiates connections, wrapping a
/// single Quinn [`Endpoint`].
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicNode {
    /// Bind a node at `config.bind_addr`, generating a fresh self-signed
    /// certificate for the server half.
    pub fn new(config: QuicConfig) -> Result<Self, TransportError> {
        let (cert_der, key_der) = generate_self_signed_cert()?;
        let server_config = build_server_config(cert_der, key_der, config.idle_timeout_ms, config.max_bi_streams)?;
        let client_config = build_client_config()?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::ConnectionFailed(format!("bind: {e}")))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(format!("local_addr: {e}")))?;

        tracing::info!(%local_addr, "quic node bound");

        Ok(Self { endpoint, local_addr })
    }

    /// The socket address this node is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming connection attempt. `None` once the
    /// endpoint has been closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Dial `addr`. `server_name` is used only for TLS SNI; since the
    /// certificate is self-signed and unchecked, any non-empty string works.
    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<Connection, TransportError> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionFailed(format!("dial {addr}: {e}")))?;
        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("handshake with {addr}: {e}")))?;
        tracing::debug!(remote = %connection.remote_address(), "quic connection established");
        Ok(connection)
    }

    /// Open a new bidirectional stream, backing one flow.
    pub async fn open_bi(connection: &Connection) -> Result<(SendStream, RecvStream), TransportError> {
        connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("open_bi: {e}")))
    }

    /// Accept the peer's next bidirectional stream.
    pub async fn accept_bi(connection: &Connection) -> Result<(SendStream, RecvStream), TransportError> {
        connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("accept_bi: {e}")))
    }

    /// Write a length-prefixed message. Wire format: `[len:4 LE][bytes]`.
    pub async fn send_message(stream: &mut SendStream, data: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(data.len())
            .map_err(|_| TransportError::Protocol("message too large for 4-byte length prefix".to_string()))?;
        stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    /// Read a length-prefixed message, rejecting anything over `max_size`.
    pub async fn recv_message(stream: &mut RecvStream, max_size: usize) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > max_size {
            return Err(TransportError::Protocol(format!(
                "message length {len} exceeds maximum {max_size}"
            )));
        }
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(buf)
    }

    /// Close the endpoint, tearing down every live connection.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.endpoint.close(quinn::VarInt::from_u32(error_code), reason);
    }

    /// The underlying Quinn endpoint, for callers that need lower-level
    /// access (the proxy relay dials and accepts on the same endpoint).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), TransportError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Internal(format!("tls key generation failed: {e}")))?;
    let params = rcgen::CertificateParams::new(vec!["fabric-node".to_string()])
        .map_err(|e| TransportError::Internal(format!("cert params failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Internal(format!("self-signed cert generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

fn build_server_config(
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    idle_timeout_ms: u32,
    max_bi_streams: u32,
) -> Result<ServerConfig, TransportError> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Internal(format!("server tls version config: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Internal(format!("server tls config: {e}")))?;
    tls_config.alpn_protocols = vec![crate::alpn_identifier()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Internal(format!("idle timeout config: {e}")))?,
    ));
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Internal(format!("quic server crypto config: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config() -> Result<ClientConfig, TransportError> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Internal(format!("client tls version config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![crate::alpn_identifier()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Internal(format!("quic client crypto config: {e}")))?,
    ));
    Ok(client_config)
}

/// Accepts any server certificate. Identity is established by the blessing
/// handshake, not by the TLS layer.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}
