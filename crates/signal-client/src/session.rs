//! Client side of one relay login.
//!
//! A [`Session`] owns its channel exclusively and every operation takes
//! `&mut self`: the wire protocol has no correlation id, so an answer is
//! matched to an offer only by arrival order, and at most one exchange may
//! be in flight. Sharing a session across tasks therefore requires an
//! explicit mutex, which serializes the exchanges.
//!
//! Closing is possible from outside the owning task through
//! [`Session::cancel_token`]; a receive blocked on a quiet relay returns
//! [`SessionError::Closed`] as soon as the token is cancelled.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Envelope, PeerId, Signal, SignalKind};
use crate::config::{RelayEndpoint, SessionConfig};
use crate::error::{ChannelError, CodecError, SessionError};
use crate::events::{CloseReason, SharedObserver, SignalEvent, TracingObserver};
use crate::transport::{SignalChannel, WebSocketChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    LoggedIn,
    Closed,
}

/// Settings and collaborators handed to a session at connect time.
#[derive(Clone)]
pub struct SessionContext {
    pub config: SessionConfig,
    pub observer: SharedObserver,
    /// Parent scope; the session runs under a child of this token.
    pub cancel: CancellationToken,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
            observer: Arc::new(TracingObserver),
            cancel: CancellationToken::new(),
        }
    }
}

impl SessionContext {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct Session<C: SignalChannel> {
    identity: PeerId,
    state: SessionState,
    channel: Option<C>,
    pending: VecDeque<Signal>,
    cancel: CancellationToken,
    config: SessionConfig,
    observer: SharedObserver,
}

impl Session<WebSocketChannel> {
    /// Opens a websocket to the relay and logs in as `identity`.
    ///
    /// A failure at any step closes whatever was opened before the error is
    /// returned.
    pub async fn connect(
        endpoint: &RelayEndpoint,
        identity: PeerId,
        context: SessionContext,
    ) -> Result<Self, SessionError> {
        let mut session = Session::unconnected(identity, context);
        session.state = SessionState::Connecting;
        if let Ok(url) = endpoint.url() {
            session.emit(SignalEvent::Connecting {
                url: url.to_string(),
            });
        }

        let opened = tokio::select! {
            _ = session.cancel.cancelled() => Err(ChannelError::Closed),
            opened = WebSocketChannel::open(endpoint) => opened,
        };
        match opened {
            Ok(channel) => session.login(channel).await?,
            Err(err) => {
                session.shutdown(CloseReason::ConnectFailed).await;
                return Err(SessionError::Connect(err));
            }
        }
        Ok(session)
    }
}

impl<C: SignalChannel> Session<C> {
    /// Logs in over an already opened channel.
    pub async fn connect_with(
        channel: C,
        identity: PeerId,
        context: SessionContext,
    ) -> Result<Self, SessionError> {
        let mut session = Session::unconnected(identity, context);
        session.state = SessionState::Connecting;
        session.login(channel).await?;
        Ok(session)
    }

    fn unconnected(identity: PeerId, context: SessionContext) -> Self {
        Self {
            identity,
            state: SessionState::Unconnected,
            channel: None,
            pending: VecDeque::new(),
            cancel: context.cancel.child_token(),
            config: context.config,
            observer: context.observer,
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that closes this session when cancelled, from any task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn login(&mut self, channel: C) -> Result<(), SessionError> {
        self.channel = Some(channel);

        let frame = match codec::encode_login(&self.identity) {
            Ok(frame) => frame,
            Err(err) => {
                self.shutdown(CloseReason::LoginFailed).await;
                return Err(SessionError::Encode(err));
            }
        };
        if let Err(err) = self.write_frame(frame).await {
            self.shutdown(CloseReason::LoginFailed).await;
            return Err(SessionError::LoginWrite(err));
        }

        self.state = SessionState::LoggedIn;
        self.emit(SignalEvent::LoggedIn {
            identity: self.identity.clone(),
        });

        if self.config.await_login_reply {
            self.await_login_reply().await?;
        }
        Ok(())
    }

    /// Consumes the relay's reply to the login. An offer that beats the
    /// registration ack is kept for the next [`wait_for_signal`](Self::wait_for_signal).
    async fn await_login_reply(&mut self) -> Result<(), SessionError> {
        let reply = match self.config.login_reply_timeout {
            Some(limit) => tokio::time::timeout(limit, self.receive_frame()).await.ok(),
            None => Some(self.receive_frame().await),
        };

        let frame = match reply {
            Some(Ok(frame)) => frame,
            // Already reported as malformed; the relay did answer.
            Some(Err(SessionError::Decode(_))) => {
                self.emit(SignalEvent::LoginReply {
                    acknowledged: true,
                    buffered_signal: false,
                });
                return Ok(());
            }
            Some(Err(err)) => return Err(err),
            // The deadline can cut a failed read's shutdown short.
            None if self.state == SessionState::Closed => return Err(SessionError::Closed),
            None => {
                self.emit(SignalEvent::LoginReply {
                    acknowledged: false,
                    buffered_signal: false,
                });
                return Ok(());
            }
        };

        let buffered_signal = match codec::decode(&frame) {
            Ok(Envelope::Signal(signal)) => {
                self.emit(SignalEvent::SignalReceived {
                    kind: signal.kind,
                    peer: signal.peer.clone(),
                });
                self.pending.push_back(signal);
                true
            }
            Ok(Envelope::Login(_)) => false,
            Err(err) => {
                self.emit(SignalEvent::MalformedFrame {
                    error: err.to_string(),
                });
                false
            }
        };
        self.emit(SignalEvent::LoginReply {
            acknowledged: true,
            buffered_signal,
        });
        Ok(())
    }

    /// Blocks until the next signal arrives.
    ///
    /// A frame that fails to decode is reported as [`SessionError::Decode`]
    /// and leaves the session open. Login envelopes (late registration acks)
    /// are skipped.
    pub async fn wait_for_signal(&mut self) -> Result<Signal, SessionError> {
        self.ensure_open().await?;
        if let Some(signal) = self.pending.pop_front() {
            return Ok(signal);
        }
        self.next_signal_from_channel().await
    }

    /// Sends an offer and returns the next signal as its answer.
    ///
    /// A signal buffered from the login reply predates the offer, so it is
    /// left for [`wait_for_signal`](Self::wait_for_signal) rather than taken
    /// as the answer.
    pub async fn send_offer(&mut self, peer: &PeerId, offer: &Value) -> Result<Signal, SessionError> {
        self.send_signal(SignalKind::Offer, peer, offer).await?;
        self.next_signal_from_channel().await
    }

    pub async fn send_answer(&mut self, peer: &PeerId, answer: &Value) -> Result<(), SessionError> {
        self.send_signal(SignalKind::Answer, peer, answer).await
    }

    /// May be called repeatedly as candidates trickle in; delivery order is the call order.
    pub async fn send_candidate(
        &mut self,
        peer: &PeerId,
        candidate: &Value,
    ) -> Result<(), SessionError> {
        self.send_signal(SignalKind::Candidate, peer, candidate).await
    }

    /// Idempotent; safe in any state.
    pub async fn close(&mut self) {
        self.shutdown(CloseReason::Local).await;
    }

    async fn send_signal(
        &mut self,
        kind: SignalKind,
        peer: &PeerId,
        data: &Value,
    ) -> Result<(), SessionError> {
        self.ensure_open().await?;
        let frame = codec::encode_signal(kind, peer, data).map_err(SessionError::Encode)?;
        match self.write_frame(frame).await {
            Ok(()) => {
                self.emit(SignalEvent::SignalSent {
                    kind,
                    peer: peer.clone(),
                });
                Ok(())
            }
            Err(ChannelError::Closed) => {
                self.shutdown(CloseReason::RemoteClosed).await;
                Err(SessionError::Closed)
            }
            Err(err) => {
                self.shutdown(CloseReason::WriteFailed).await;
                Err(SessionError::Write(err))
            }
        }
    }

    async fn next_signal_from_channel(&mut self) -> Result<Signal, SessionError> {
        loop {
            let frame = self.receive_frame().await?;
            match codec::decode(&frame) {
                Ok(Envelope::Signal(signal)) => {
                    self.emit(SignalEvent::SignalReceived {
                        kind: signal.kind,
                        peer: signal.peer.clone(),
                    });
                    return Ok(signal);
                }
                Ok(Envelope::Login(_)) => {
                    self.emit(SignalEvent::LoginReply {
                        acknowledged: true,
                        buffered_signal: false,
                    });
                }
                Err(err) => {
                    self.emit(SignalEvent::MalformedFrame {
                        error: err.to_string(),
                    });
                    return Err(SessionError::Decode(err));
                }
            }
        }
    }

    /// Reads one frame, racing the session's cancellation scope.
    async fn receive_frame(&mut self) -> Result<String, SessionError> {
        let cancel = self.cancel.clone();
        let channel = self.channel.as_mut().ok_or(SessionError::Closed)?;
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            frame = channel.recv_text() => Some(frame),
        };
        match received {
            Some(Ok(frame)) => Ok(frame),
            None => {
                self.shutdown(CloseReason::Cancelled).await;
                Err(SessionError::Closed)
            }
            Some(Err(ChannelError::Closed)) => {
                self.shutdown(CloseReason::RemoteClosed).await;
                Err(SessionError::Closed)
            }
            Some(Err(ChannelError::InvalidFrame(reason))) => {
                let err = CodecError::NotText(reason);
                self.emit(SignalEvent::MalformedFrame {
                    error: err.to_string(),
                });
                Err(SessionError::Decode(err))
            }
            Some(Err(err)) => {
                self.shutdown(CloseReason::ReadFailed).await;
                Err(SessionError::Read(err))
            }
        }
    }

    async fn write_frame(&mut self, frame: String) -> Result<(), ChannelError> {
        let channel = self.channel.as_mut().ok_or(ChannelError::Closed)?;
        channel.send_text(frame).await
    }

    async fn ensure_open(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed || self.channel.is_none() {
            return Err(SessionError::Closed);
        }
        if self.cancel.is_cancelled() {
            self.shutdown(CloseReason::Cancelled).await;
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.cancel.cancel();
        self.pending.clear();
        if let Some(mut channel) = self.channel.take() {
            channel.close(&self.config.close_reason).await;
        }
        self.emit(SignalEvent::Closed {
            identity: self.identity.clone(),
            reason,
        });
    }

    fn emit(&self, event: SignalEvent) {
        self.observer.on_event(&event);
    }
}

impl<C: SignalChannel> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<C: SignalChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
