//! Drives a full offer/answer/candidate exchange over a [`Session`].
//!
//! The session itself never retries or times out; this layer owns those
//! policies. Waits for an offer or answer are bounded by
//! [`NegotiationConfig::signal_timeout`] and retried up to
//! `max_idle_waits` times. The candidate loop polls the media layer every
//! `candidate_poll_interval` until it reports completion, and the whole run
//! is bounded by `negotiation_timeout`.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec::{PeerId, Signal, SignalKind};
use crate::config::{NegotiationConfig, RelayEndpoint, RetryPolicy};
use crate::error::{MediaError, NegotiationError, NegotiationStage, SessionError};
use crate::events::{SharedObserver, SignalEvent};
use crate::session::{Session, SessionContext};
use crate::transport::{SignalChannel, WebSocketChannel};

/// The media/ICE layer that produces and consumes signaling payloads.
///
/// Payloads are opaque to the signaling core; their schema is checked here.
#[async_trait]
pub trait MediaNegotiator: Send {
    async fn create_offer(&mut self) -> Result<Value, MediaError>;

    async fn apply_answer(&mut self, answer: Value) -> Result<(), MediaError>;

    async fn accept_offer(&mut self, from: &PeerId, offer: Value) -> Result<Value, MediaError>;

    async fn add_remote_candidate(&mut self, candidate: Value) -> Result<(), MediaError>;

    /// Local candidates gathered since the previous call.
    fn take_local_candidates(&mut self) -> Vec<Value>;

    /// True once the media layer no longer needs signaling.
    fn is_complete(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub peer: PeerId,
    pub local_candidates_sent: usize,
    pub remote_candidates_applied: usize,
}

impl NegotiationOutcome {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            local_candidates_sent: 0,
            remote_candidates_applied: 0,
        }
    }
}

pub struct Negotiator {
    config: NegotiationConfig,
    observer: SharedObserver,
}

impl Negotiator {
    pub fn new(config: NegotiationConfig, observer: SharedObserver) -> Self {
        Self { config, observer }
    }

    /// Connects to the relay, retrying connect failures with backoff.
    pub async fn connect(
        &self,
        endpoint: &RelayEndpoint,
        identity: &PeerId,
        context: SessionContext,
        retry: &RetryPolicy,
    ) -> Result<Session<WebSocketChannel>, NegotiationError> {
        let cancel = context.cancel.clone();
        connect_with_retry(retry, &self.observer, &cancel, || {
            Session::connect(endpoint, identity.clone(), context.clone())
        })
        .await
    }

    /// Offers to `peer`, applies the answer, then trickles candidates.
    pub async fn run_initiator<C, M>(
        &self,
        session: &mut Session<C>,
        peer: &PeerId,
        media: &mut M,
    ) -> Result<NegotiationOutcome, NegotiationError>
    where
        C: SignalChannel,
        M: MediaNegotiator,
    {
        let bounded = timeout(
            self.config.negotiation_timeout,
            self.initiate(session, peer, media),
        );
        bounded
            .await
            .map_err(|_| NegotiationError::timeout(NegotiationStage::Overall))?
    }

    /// Waits for an offer, answers it, then trickles candidates.
    ///
    /// The answer goes to `reply_to` when given, otherwise to the `peer`
    /// named in the offer envelope.
    pub async fn run_responder<C, M>(
        &self,
        session: &mut Session<C>,
        reply_to: Option<&PeerId>,
        media: &mut M,
    ) -> Result<NegotiationOutcome, NegotiationError>
    where
        C: SignalChannel,
        M: MediaNegotiator,
    {
        let bounded = timeout(
            self.config.negotiation_timeout,
            self.respond(session, reply_to, media),
        );
        bounded
            .await
            .map_err(|_| NegotiationError::timeout(NegotiationStage::Overall))?
    }

    async fn initiate<C, M>(
        &self,
        session: &mut Session<C>,
        peer: &PeerId,
        media: &mut M,
    ) -> Result<NegotiationOutcome, NegotiationError>
    where
        C: SignalChannel,
        M: MediaNegotiator,
    {
        let mut outcome = NegotiationOutcome::new(peer.clone());
        let offer = media.create_offer().await?;

        let mut idle_waits = 0;
        let sent = timeout(self.config.signal_timeout, session.send_offer(peer, &offer)).await;
        let mut reply = match sent {
            Ok(Ok(signal)) => Some(signal),
            Ok(Err(SessionError::Decode(_))) if !self.config.fail_on_malformed => None,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                idle_waits = 1;
                self.emit(SignalEvent::WaitExpired {
                    stage: NegotiationStage::Answer,
                    idle_waits,
                });
                None
            }
        };

        let mut early_candidates = Vec::new();
        let answer = loop {
            let signal = match reply.take() {
                Some(signal) => signal,
                None => {
                    self.next_signal(session, NegotiationStage::Answer, idle_waits)
                        .await?
                }
            };
            idle_waits = 0;
            match signal.kind {
                SignalKind::Answer => break signal,
                SignalKind::Candidate => early_candidates.push(signal.data),
                SignalKind::Offer => {
                    return Err(NegotiationError::UnexpectedSignal {
                        expected: SignalKind::Answer,
                        actual: SignalKind::Offer,
                    });
                }
            }
        };

        media.apply_answer(answer.data).await?;
        for candidate in early_candidates {
            media.add_remote_candidate(candidate).await?;
            outcome.remote_candidates_applied += 1;
        }

        self.exchange_candidates(session, peer, media, &mut outcome)
            .await?;
        Ok(outcome)
    }

    async fn respond<C, M>(
        &self,
        session: &mut Session<C>,
        reply_to: Option<&PeerId>,
        media: &mut M,
    ) -> Result<NegotiationOutcome, NegotiationError>
    where
        C: SignalChannel,
        M: MediaNegotiator,
    {
        let mut early_candidates = Vec::new();
        let offer = loop {
            let signal = self.next_signal(session, NegotiationStage::Offer, 0).await?;
            match signal.kind {
                SignalKind::Offer => break signal,
                SignalKind::Candidate => early_candidates.push(signal.data),
                SignalKind::Answer => self.stray(&signal),
            }
        };

        let peer = reply_to.cloned().unwrap_or_else(|| offer.peer.clone());
        let mut outcome = NegotiationOutcome::new(peer.clone());

        let answer = media.accept_offer(&offer.peer, offer.data).await?;
        session.send_answer(&peer, &answer).await?;

        for candidate in early_candidates {
            media.add_remote_candidate(candidate).await?;
            outcome.remote_candidates_applied += 1;
        }

        self.exchange_candidates(session, &peer, media, &mut outcome)
            .await?;
        Ok(outcome)
    }

    async fn exchange_candidates<C, M>(
        &self,
        session: &mut Session<C>,
        peer: &PeerId,
        media: &mut M,
        outcome: &mut NegotiationOutcome,
    ) -> Result<(), NegotiationError>
    where
        C: SignalChannel,
        M: MediaNegotiator,
    {
        let mut idle_waits = 0;
        loop {
            for candidate in media.take_local_candidates() {
                session.send_candidate(peer, &candidate).await?;
                outcome.local_candidates_sent += 1;
            }
            if media.is_complete() {
                return Ok(());
            }

            match timeout(self.config.candidate_poll_interval, session.wait_for_signal()).await {
                Ok(Ok(signal)) => {
                    idle_waits = 0;
                    if signal.kind == SignalKind::Candidate {
                        media.add_remote_candidate(signal.data).await?;
                        outcome.remote_candidates_applied += 1;
                    } else {
                        self.stray(&signal);
                    }
                }
                Ok(Err(SessionError::Decode(_))) if !self.config.fail_on_malformed => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    idle_waits += 1;
                    self.emit(SignalEvent::WaitExpired {
                        stage: NegotiationStage::Candidates,
                        idle_waits,
                    });
                }
            }
        }
    }

    /// Next signal within `signal_timeout`, tolerating `max_idle_waits`
    /// consecutive expirations (counting `idle_waits` already spent) and,
    /// unless configured otherwise, malformed frames.
    async fn next_signal<C: SignalChannel>(
        &self,
        session: &mut Session<C>,
        stage: NegotiationStage,
        mut idle_waits: u32,
    ) -> Result<Signal, NegotiationError> {
        loop {
            match timeout(self.config.signal_timeout, session.wait_for_signal()).await {
                Ok(Ok(signal)) => return Ok(signal),
                Ok(Err(SessionError::Decode(_))) if !self.config.fail_on_malformed => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    idle_waits += 1;
                    self.emit(SignalEvent::WaitExpired { stage, idle_waits });
                    if idle_waits > self.config.max_idle_waits {
                        return Err(NegotiationError::timeout(stage));
                    }
                }
            }
        }
    }

    fn stray(&self, signal: &Signal) {
        self.emit(SignalEvent::StraySignal {
            kind: signal.kind,
            peer: signal.peer.clone(),
        });
    }

    fn emit(&self, event: SignalEvent) {
        self.observer.on_event(&event);
    }
}

/// Runs `attempt` until it yields a session, backing off between connect
/// failures. Errors other than [`SessionError::Connect`] are returned at once.
pub async fn connect_with_retry<C, F, Fut>(
    retry: &RetryPolicy,
    observer: &SharedObserver,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<Session<C>, NegotiationError>
where
    C: SignalChannel,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Session<C>, SessionError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(session) => return Ok(session),
            Err(SessionError::Connect(err)) if attempts < max_attempts => {
                let delay = retry.backoff_for(attempts);
                observer.on_event(&SignalEvent::ConnectRetry {
                    attempt: attempts,
                    delay,
                    error: err.to_string(),
                });
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SessionError::Closed.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(SessionError::Connect(last)) => {
                return Err(NegotiationError::RetriesExhausted { attempts, last });
            }
            Err(err) => return Err(err.into()),
        }
    }
}
