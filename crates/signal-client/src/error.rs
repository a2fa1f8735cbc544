use thiserror::Error;

use crate::codec::SignalKind;

/// Failures surfaced by a [`SignalChannel`](crate::transport::SignalChannel).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay write failed: {0}")]
    Write(String),
    #[error("relay read failed: {0}")]
    Read(String),
    /// A frame arrived that cannot be text; the connection stays usable.
    #[error("relay sent a frame that is not valid UTF-8: {0}")]
    InvalidFrame(String),
    #[error("relay channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame is not UTF-8 text: {0}")]
    NotText(String),
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("frame field `{0}` has the wrong type or is empty")]
    InvalidField(&'static str),
    #[error("unknown signal kind `{0}`")]
    UnknownKind(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(#[source] ChannelError),
    #[error("login write failed: {0}")]
    LoginWrite(#[source] ChannelError),
    #[error("write failed: {0}")]
    Write(#[source] ChannelError),
    #[error("read failed: {0}")]
    Read(#[source] ChannelError),
    #[error("encode failed: {0}")]
    Encode(#[source] CodecError),
    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether the session is unusable after this error.
    ///
    /// Decode and encode failures leave the channel live; everything else
    /// moves the session to `Closed`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Decode(_) | SessionError::Encode(_))
    }
}

#[derive(Debug, Error)]
#[error("media layer: {0}")]
pub struct MediaError(pub String);

/// Point in a negotiation where a bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    Answer,
    Offer,
    Candidates,
    Overall,
}

impl std::fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NegotiationStage::Answer => "answer",
            NegotiationStage::Offer => "offer",
            NegotiationStage::Candidates => "candidates",
            NegotiationStage::Overall => "negotiation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("timed out waiting for {stage}")]
    Timeout { stage: NegotiationStage },
    #[error("expected {expected} but received {actual}")]
    UnexpectedSignal {
        expected: SignalKind,
        actual: SignalKind,
    },
    #[error("gave up connecting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ChannelError },
}

impl NegotiationError {
    pub(crate) fn timeout(stage: NegotiationStage) -> Self {
        NegotiationError::Timeout { stage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_not_fatal() {
        let err = SessionError::Decode(CodecError::MissingField("peer"));
        assert!(!err.is_fatal());
        assert!(SessionError::Closed.is_fatal());
        assert!(SessionError::Read(ChannelError::Read("reset".into())).is_fatal());
    }
}
