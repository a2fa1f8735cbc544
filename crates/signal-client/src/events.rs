//! Structured events emitted by sessions and negotiations.
//!
//! The session core never writes logs directly; it reports to a
//! [`SignalObserver`] supplied by the caller. [`TracingObserver`] forwards
//! everything to `tracing` under the `signal` target.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{PeerId, SignalKind};
use crate::error::NegotiationStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Cancelled,
    RemoteClosed,
    ConnectFailed,
    LoginFailed,
    ReadFailed,
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Connecting {
        url: String,
    },
    LoggedIn {
        identity: PeerId,
    },
    LoginReply {
        acknowledged: bool,
        buffered_signal: bool,
    },
    SignalSent {
        kind: SignalKind,
        peer: PeerId,
    },
    SignalReceived {
        kind: SignalKind,
        peer: PeerId,
    },
    MalformedFrame {
        error: String,
    },
    StraySignal {
        kind: SignalKind,
        peer: PeerId,
    },
    WaitExpired {
        stage: NegotiationStage,
        idle_waits: u32,
    },
    ConnectRetry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Closed {
        identity: PeerId,
        reason: CloseReason,
    },
}

pub trait SignalObserver: Send + Sync {
    fn on_event(&self, event: &SignalEvent);
}

pub type SharedObserver = Arc<dyn SignalObserver>;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SignalObserver for TracingObserver {
    fn on_event(&self, event: &SignalEvent) {
        match event {
            SignalEvent::Connecting { url } => {
                tracing::info!(target: "signal", %url, "connecting to relay");
            }
            SignalEvent::LoggedIn { identity } => {
                tracing::info!(target: "signal", %identity, "login sent");
            }
            SignalEvent::LoginReply {
                acknowledged,
                buffered_signal,
            } => {
                if *acknowledged {
                    tracing::debug!(target: "signal", buffered_signal, "relay answered login");
                } else {
                    tracing::warn!(target: "signal", "relay did not answer login in time");
                }
            }
            SignalEvent::SignalSent { kind, peer } => {
                tracing::debug!(target: "signal", %kind, %peer, "sent signal");
            }
            SignalEvent::SignalReceived { kind, peer } => {
                tracing::debug!(target: "signal", %kind, %peer, "received signal");
            }
            SignalEvent::MalformedFrame { error } => {
                tracing::warn!(target: "signal", %error, "dropping malformed relay frame");
            }
            SignalEvent::StraySignal { kind, peer } => {
                tracing::debug!(target: "signal", %kind, %peer, "ignoring signal outside its round");
            }
            SignalEvent::WaitExpired { stage, idle_waits } => {
                tracing::debug!(target: "signal", %stage, idle_waits, "wait for relay expired");
            }
            SignalEvent::ConnectRetry {
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    target: "signal",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "relay connect failed; retrying"
                );
            }
            SignalEvent::Closed { identity, reason } => {
                tracing::info!(target: "signal", %identity, ?reason, "session closed");
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SignalObserver for NoopObserver {
    fn on_event(&self, _event: &SignalEvent) {}
}

pub fn tracing_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}
