use async_trait::async_trait;
use tokio::sync::mpsc;

use super::SignalChannel;
use crate::error::ChannelError;

/// In-process channel whose far end is a [`MemoryRelay`].
///
/// Useful for hosting both sides of a negotiation in one process and for
/// driving a [`Session`](crate::session::Session) from tests.
pub struct MemoryChannel {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<Result<String, ChannelError>>,
}

/// Relay side of a [`MemoryChannel`]: observes outbound frames and injects inbound ones.
pub struct MemoryRelay {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String, ChannelError>>>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryRelay) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            MemoryChannel {
                outbound: Some(outbound_tx),
                inbound: inbound_rx,
            },
            MemoryRelay {
                outbound: outbound_rx,
                inbound: Some(inbound_tx),
            },
        )
    }
}

#[async_trait]
impl SignalChannel for MemoryChannel {
    async fn send_text(&mut self, frame: String) -> Result<(), ChannelError> {
        let outbound = self.outbound.as_ref().ok_or(ChannelError::Closed)?;
        outbound
            .send(frame)
            .map_err(|_| ChannelError::Write("relay hung up".into()))
    }

    async fn recv_text(&mut self) -> Result<String, ChannelError> {
        if self.outbound.is_none() {
            return Err(ChannelError::Closed);
        }
        match self.inbound.recv().await {
            Some(frame) => frame,
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self, _reason: &str) {
        self.outbound = None;
        self.inbound.close();
    }
}

impl MemoryRelay {
    /// Next frame written by the channel, or `None` once the channel is closed or dropped.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Delivers a frame to the channel. Returns `false` if the channel is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.deliver(Ok(frame.into()))
    }

    /// Makes the channel's next receive fail with a read error.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.deliver(Err(ChannelError::Read(message.into())))
    }

    /// Delivers a frame that cannot be read as text.
    pub fn push_invalid(&self, reason: impl Into<String>) -> bool {
        self.deliver(Err(ChannelError::InvalidFrame(reason.into())))
    }

    /// Ends the inbound stream; queued frames are still delivered first.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    fn deliver(&self, frame: Result<String, ChannelError>) -> bool {
        match &self.inbound {
            Some(inbound) => inbound.send(frame).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_in_both_directions_in_order() {
        let (mut channel, mut relay) = MemoryChannel::pair();
        channel.send_text("one".into()).await.expect("send one");
        channel.send_text("two".into()).await.expect("send two");
        assert_eq!(relay.next_frame().await.as_deref(), Some("one"));
        assert_eq!(relay.next_frame().await.as_deref(), Some("two"));
        assert_eq!(relay.try_next_frame(), None);

        assert!(relay.push("three"));
        assert_eq!(channel.recv_text().await.expect("recv"), "three");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_io() {
        let (mut channel, mut relay) = MemoryChannel::pair();
        channel.close("done").await;
        channel.close("done").await;
        assert_eq!(channel.send_text("late".into()).await, Err(ChannelError::Closed));
        assert_eq!(channel.recv_text().await, Err(ChannelError::Closed));
        assert_eq!(relay.next_frame().await, None);
        assert!(!relay.push("ignored"));
    }

    #[tokio::test]
    async fn hang_up_surfaces_as_closed_after_queued_frames() {
        let (mut channel, mut relay) = MemoryChannel::pair();
        relay.push("last words");
        relay.hang_up();
        assert_eq!(channel.recv_text().await.expect("queued"), "last words");
        assert_eq!(channel.recv_text().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn invalid_frame_does_not_end_the_stream() {
        let (mut channel, relay) = MemoryChannel::pair();
        relay.push_invalid("invalid utf-8 sequence");
        relay.push("after");
        assert!(matches!(
            channel.recv_text().await,
            Err(ChannelError::InvalidFrame(_))
        ));
        assert_eq!(channel.recv_text().await.expect("next frame"), "after");
    }

    #[tokio::test]
    async fn dropped_relay_fails_writes() {
        let (mut channel, relay) = MemoryChannel::pair();
        drop(relay);
        assert!(matches!(
            channel.send_text("hello".into()).await,
            Err(ChannelError::Write(_))
        ));
    }
}
