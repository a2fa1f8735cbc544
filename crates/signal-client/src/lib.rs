//! Client side of a relay-brokered signaling exchange.
//!
//! Peers that want a direct media/data connection first trade offers,
//! answers and ICE candidates through a relay that routes frames by login
//! identity. [`Session`] speaks that protocol over one relay connection;
//! [`Negotiator`] drives a complete exchange on top of it.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod session;
pub mod transport;

pub use codec::{Envelope, PeerId, Signal, SignalKind};
pub use config::{NegotiationConfig, RelayEndpoint, RetryPolicy, SessionConfig};
pub use error::{ChannelError, CodecError, MediaError, NegotiationError, SessionError};
pub use events::{NoopObserver, SharedObserver, SignalEvent, SignalObserver, TracingObserver};
pub use negotiation::{MediaNegotiator, NegotiationOutcome, Negotiator};
pub use session::{Session, SessionContext, SessionState};
pub use transport::{MemoryChannel, MemoryRelay, SignalChannel, WebSocketChannel};
