//! The streaming call API and cancellation (§4.F).
//!
//! A call is just one more flow on an already-authenticated circuit: no
//! handshake runs here, because [`crate::dial::Dialer`] and
//! [`crate::listen::Listener`] both already ran one on the circuit's first
//! flow. `Call::start` opens a fresh flow and writes `StartCall`;
//! `Call::accept` reads one off a listener. Everything after that is
//! `Send`/`Recv` in both directions until one side calls `finish` or
//! `fail`, or the call is canceled.
//!
//! Cancellation and deadlines are both just another branch in a `select!`
//! around each I/O step, backed by a [`CancellationToken`] so a caller
//! holding a clone can cancel a call that's blocked in a concurrent task.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use fabric_types::endpoint::RoutingId;

use crate::flow::Flow;
use crate::messages::{CallFrame, WireErrorKind};
use crate::{Result, TransportError};

/// Per-call knobs: a deadline, a cancellation handle, and whether the
/// caller considers its arguments non-confidential for impetus-fingerprint
/// purposes (see `fabric_security::impetus`).
#[derive(Clone)]
pub struct CallOptions {
    /// Wall-clock deadline after which an in-flight send or receive fails
    /// with [`TransportError::Timeout`].
    pub deadline: Option<Instant>,
    /// Cancellation handle. Cloning this and calling
    /// [`CancellationToken::cancel`] from elsewhere unblocks any send or
    /// receive currently in flight on this call with
    /// [`TransportError::Canceled`].
    pub cancel: CancellationToken,
    /// Whether this call's arguments should be treated as non-confidential
    /// when computing a third-party caveat's impetus fingerprint.
    pub non_confidential: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self { deadline: None, cancel: CancellationToken::new(), non_confidential: false }
    }
}

/// What a freshly accepted call asked for, before the handler decides
/// whether to [`Call::accept_call`] or [`Call::fail`] it.
pub struct StartCallInfo {
    /// Fully qualified method name.
    pub method: String,
    /// Number of positional arguments the caller said it will send.
    pub num_args: u32,
    /// Whether the caller flagged its arguments non-confidential.
    pub non_confidential: bool,
}

/// One call's flow, from `StartCall` through `Finish`, usable by either the
/// caller or the callee.
pub struct Call {
    flow: Flow,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    send_finished: bool,
    recv_finished: bool,
}

impl Call {
    /// Caller side: open a new flow on `connection` targeting
    /// `target_routing_id` and write its `StartCall` header.
    pub async fn start(
        connection: &quinn::Connection,
        target_routing_id: RoutingId,
        method: &str,
        num_args: u32,
        opts: CallOptions,
    ) -> Result<Self> {
        let mut flow = race(opts.deadline, &opts.cancel, Flow::open_targeted(connection, target_routing_id)).await?;
        race(
            opts.deadline,
            &opts.cancel,
            flow.send_frame(&CallFrame::StartCall {
                method: method.to_string(),
                num_args,
                non_confidential: opts.non_confidential,
            }),
        )
        .await?;
        Ok(Self {
            flow,
            cancel: opts.cancel,
            deadline: opts.deadline,
            send_finished: false,
            recv_finished: false,
        })
    }

    /// Callee side: accept the next flow on an already-handshaked
    /// `connection` and read off its `StartCall` header.
    pub async fn accept(connection: &quinn::Connection) -> Result<(Self, StartCallInfo)> {
        let (mut flow, _target) = Flow::accept_targeted(connection).await?;
        let frame: CallFrame = flow.recv_frame().await?;
        let info = match frame {
            CallFrame::StartCall { method, num_args, non_confidential } => {
                StartCallInfo { method, num_args, non_confidential }
            }
            other => return Err(TransportError::Protocol(format!("expected StartCall, got {other:?}"))),
        };
        let call = Self {
            flow,
            cancel: CancellationToken::new(),
            deadline: None,
            send_finished: false,
            recv_finished: false,
        };
        Ok((call, info))
    }

    /// Callee side only: acknowledge the call, letting the caller know
    /// results will follow.
    pub async fn accept_call(&mut self) -> Result<()> {
        self.send_raw(CallFrame::Accept).await
    }

    /// Send one streamed value (an argument, if the caller, or a result, if
    /// the callee).
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = crate::messages::encode(value)?;
        self.send_raw(CallFrame::Send { payload }).await
    }

    /// Declare no more values will be sent in this direction. Idempotent.
    pub async fn finish_send(&mut self) -> Result<()> {
        if self.send_finished {
            return Ok(());
        }
        self.send_raw(CallFrame::FinishSend).await?;
        self.send_finished = true;
        Ok(())
    }

    /// Receive the next streamed value, or `None` once the peer has
    /// finished sending in this direction.
    pub async fn recv<T: for<'de> Deserialize<'de>>(&mut self) -> Result<Option<T>> {
        if self.recv_finished {
            return Ok(None);
        }
        loop {
            match self.recv_raw().await? {
                CallFrame::Send { payload } => return Ok(Some(crate::messages::decode(&payload)?)),
                CallFrame::Accept => continue,
                CallFrame::FinishSend | CallFrame::Finish => {
                    self.recv_finished = true;
                    return Ok(None);
                }
                CallFrame::Error { kind, message } => return Err(wire_error(kind, message)),
                CallFrame::Cancel => {
                    self.recv_finished = true;
                    return Err(TransportError::Canceled);
                }
                CallFrame::StartCall { .. } => {
                    return Err(TransportError::Protocol("unexpected StartCall mid-call".to_string()))
                }
            }
        }
    }

    /// Finish the call successfully: stop sending in this direction (if not
    /// already) and send a terminal `Finish`.
    pub async fn finish(mut self) -> Result<()> {
        self.finish_send().await?;
        self.send_raw(CallFrame::Finish).await?;
        let _ = self.flow.finish_send();
        Ok(())
    }

    /// Fail the call, surfacing `error`'s kind and message to the peer.
    pub async fn fail(mut self, error: &fabric_types::Error) -> Result<()> {
        let kind: WireErrorKind = error.kind().into();
        self.send_raw(CallFrame::Error { kind, message: error.to_string() }).await
    }

    /// Abandon the call before it finished normally, telling the peer so it
    /// can stop waiting on it.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        let _ = self.flow.send_frame(&CallFrame::Cancel).await;
        self.flow.reset(0);
    }

    /// A handle that can cancel this call from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn send_raw(&mut self, frame: CallFrame) -> Result<()> {
        race(self.deadline, &self.cancel, self.flow.send_frame(&frame)).await
    }

    async fn recv_raw(&mut self) -> Result<CallFrame> {
        race(self.deadline, &self.cancel, self.flow.recv_frame()).await
    }
}

fn wire_error(kind: WireErrorKind, message: String) -> TransportError {
    let kind: fabric_types::ErrorKind = kind.into();
    match kind {
        fabric_types::ErrorKind::Canceled => TransportError::Canceled,
        fabric_types::ErrorKind::Timeout => TransportError::Timeout,
        fabric_types::ErrorKind::ConnectionFailed => TransportError::ConnectionFailed(message),
        fabric_types::ErrorKind::AuthFailed => TransportError::AuthFailed(message),
        other => TransportError::Application { kind: other, message },
    }
}

/// Race `fut` against cancellation and an optional deadline.
async fn race<T, F>(deadline: Option<Instant>, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => {
            tokio::select! {
                res = fut => res,
                () = cancel.cancelled() => Err(TransportError::Canceled),
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => Err(TransportError::Timeout),
            }
        }
        None => {
            tokio::select! {
                res = fut => res,
                () = cancel.cancelled() => Err(TransportError::Canceled),
            }
        }
    }
}
