use async_trait::async_trait;

use crate::error::ChannelError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryChannel, MemoryRelay};
pub use websocket::WebSocketChannel;

/// Ordered, bidirectional text-frame connection to the signaling relay.
///
/// Each `send_text` call is exactly one frame on the wire and each
/// `recv_text` yields exactly one complete frame. `recv_text` must be
/// cancel-safe: dropping the future before it completes may not lose a frame.
#[async_trait]
pub trait SignalChannel: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), ChannelError>;

    async fn recv_text(&mut self) -> Result<String, ChannelError>;

    /// Idempotent. After close every send and receive fails with
    /// [`ChannelError::Closed`].
    async fn close(&mut self, reason: &str);
}
