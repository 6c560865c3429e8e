//! Dialing a real discharger over the wire (§4.C, §4.G).
//!
//! [`handshake::DischargeFetcher`] is defined in `fabric-transport` as a bare
//! trait so that crate does not have to depend on a dialer implementation
//! that itself depends on the handshake. This module is the implementation
//! that trait's doc comment promises: it dials `discharger_location` as a
//! bare endpoint and asks for a discharge over a `Call`.
//!
//! It also provides the other half: a discharger server that mints
//! discharges for whatever third-party ids it is asked about, signed by its
//! own principal key, valid for a fixed TTL from the time of the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fabric_security::discharge::Discharge;
use fabric_security::{Caveat, Principal};
use fabric_transport::call::{Call, CallOptions};
use fabric_transport::dial::Dialer;
use fabric_transport::handshake::{DischargeFetcher, NoDischargeFetcher};
use fabric_transport::listen::{IncomingCircuit, Listener};
use fabric_transport::{Result as TransportResult, TransportError};

const METHOD: &str = "Discharge";

/// How long a freshly minted discharge remains valid, absent a narrower
/// request from the caveat itself.
pub const DEFAULT_DISCHARGE_TTL: Duration = Duration::from_secs(600);

#[derive(Serialize, Deserialize)]
struct DischargeRequest {
    third_party_id: [u8; 32],
    requested_caveats: Vec<Caveat>,
}

/// Fetches discharges by dialing their discharger over `fabric-transport`.
pub struct RpcDischargeFetcher {
    dialer: Arc<Dialer>,
    principal: Arc<dyn Principal>,
}

impl RpcDischargeFetcher {
    /// Fetch discharges as `principal`, dialing through `dialer`.
    pub fn new(dialer: Arc<Dialer>, principal: Arc<dyn Principal>) -> Self {
        Self { dialer, principal }
    }
}

#[async_trait]
impl DischargeFetcher for RpcDischargeFetcher {
    async fn fetch(
        &self,
        third_party_id: [u8; 32],
        discharger_location: &str,
        requested_caveats: &[Caveat],
    ) -> TransportResult<Discharge> {
        let endpoint = fabric_types::Endpoint::parse(discharger_location)?;
        let circuit = self
            .dialer
            .dial_endpoint(&endpoint, self.principal.as_ref(), &NoDischargeFetcher, 0)
            .await?;
        let mut call = Call::start(
            &circuit.connection,
            endpoint.routing_id,
            METHOD,
            1,
            CallOptions::default(),
        )
        .await?;
        call.send(&DischargeRequest { third_party_id, requested_caveats: requested_caveats.to_vec() }).await?;
        call.finish_send().await?;
        let discharge: Discharge = call
            .recv()
            .await?
            .ok_or_else(|| TransportError::Protocol("discharger closed the call with no reply".to_string()))?;
        call.finish().await?;
        Ok(discharge)
    }
}

/// Serves [`DischargeRequest`]s over an already-accepted circuit, minting a
/// discharge signed by `principal` for whatever third-party id is asked
/// about. A production discharger would consult revocation state or policy
/// here; this one mints unconditionally, which is sufficient for the
/// first-party caveats this workspace issues to itself.
pub async fn serve_circuit(circuit: &IncomingCircuit, principal: &dyn Principal, now: u64) -> TransportResult<()> {
    loop {
        let (mut call, info) = match Call::accept(&circuit.connection).await {
            Ok(v) => v,
            Err(TransportError::ConnectionFailed(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if info.method != METHOD {
            call.fail(&fabric_types::Error::new(
                fabric_types::ErrorKind::Internal,
                format!("discharger does not serve method {}", info.method),
            ))
            .await?;
            continue;
        }
        call.accept_call().await?;
        let request: DischargeRequest = call
            .recv()
            .await?
            .ok_or_else(|| TransportError::Protocol("discharge request had no body".to_string()))?;
        let not_after = now + DEFAULT_DISCHARGE_TTL.as_secs();
        let caveats = if request.requested_caveats.is_empty() {
            vec![Caveat::Expiry { not_after }]
        } else {
            request.requested_caveats
        };
        let transcript = Discharge::signing_transcript(request.third_party_id, &caveats);
        let signature = principal.sign(&transcript);
        let discharge = Discharge::from_signature(request.third_party_id, caveats, signature);
        call.send(&discharge).await?;
        call.finish().await?;
    }
}

/// Runs a discharger server forever over `listener`, accepting one circuit
/// at a time and serving it until the peer disconnects.
pub async fn run_discharger(listener: Listener, principal: Arc<dyn Principal>, now_fn: impl Fn() -> u64) -> TransportResult<()> {
    loop {
        let circuit = listener.accept_circuit(principal.as_ref(), &NoDischargeFetcher, now_fn()).await?;
        let principal = Arc::clone(&principal);
        tokio::spawn(async move {
            if let Err(e) = serve_circuit(&circuit, principal.as_ref(), now_fn_snapshot()).await {
                tracing::warn!(error = %e, "discharger circuit ended with an error");
            }
        });
    }
}

fn now_fn_snapshot() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_security::principal::LocalPrincipal;
    use fabric_transport::listen::ListenSpec;

    #[tokio::test]
    async fn a_client_fetches_a_discharge_minted_by_a_real_discharger() {
        let discharger_principal: Arc<dyn Principal> = Arc::new(LocalPrincipal::generate());
        let client_principal: Arc<dyn Principal> = Arc::new(LocalPrincipal::generate());
        let routing_id = fabric_types::RoutingId::generate();

        let listener = Listener::bind(
            ListenSpec { bind_addr: "127.0.0.1:0".parse().expect("valid addr"), ..Default::default() },
            routing_id,
        )
        .await
        .expect("test setup");
        let endpoint = listener.published_endpoint(false, Vec::new());
        let discharger_key = discharger_principal.public_key();

        let server_task = tokio::spawn(async move {
            let circuit = listener.accept_circuit(discharger_principal.as_ref(), &NoDischargeFetcher, 0).await.expect("test setup");
            serve_circuit(&circuit, discharger_principal.as_ref(), 0).await.expect("test setup");
        });

        let node = Arc::new(
            fabric_transport::quic::QuicNode::new(fabric_transport::quic::QuicConfig {
                bind_addr: "127.0.0.1:0".parse().expect("valid addr"),
                ..Default::default()
            })
            .expect("test setup"),
        );
        let dialer = Arc::new(Dialer::new(node, fabric_transport::dial::DialPolicy::default()));
        let fetcher = RpcDischargeFetcher::new(dialer, client_principal);

        let location = endpoint.format().expect("format");
        let discharge = fetcher.fetch([9u8; 32], &location, &[]).await.expect("test setup");
        assert_eq!(discharge.third_party_id, [9u8; 32]);
        assert!(discharge.verify_signature(&discharger_key).is_ok());

        drop(server_task);
    }
}
