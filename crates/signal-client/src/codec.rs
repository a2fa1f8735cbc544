//! Wire format for relay frames.
//!
//! Every frame is a single JSON object tagged by its `signal` field:
//!
//! ```text
//! {"signal":"login","login":"<identity>"}
//! {"signal":"offer"|"answer"|"candidate","peer":"<peer>","data":<opaque>}
//! ```
//!
//! The `data` payload belongs to the media layer and is carried as an
//! uninterpreted [`serde_json::Value`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

const LOGIN_KIND: &str = "login";

/// Name of one endpoint in the relay's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }

    fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub identity: PeerId,
}

/// One negotiation step addressed to (or arriving for) a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub peer: PeerId,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Login(Login),
    Signal(Signal),
}

#[derive(Serialize)]
struct LoginFrame<'a> {
    signal: &'static str,
    login: &'a str,
}

#[derive(Serialize)]
struct SignalFrame<'a> {
    signal: SignalKind,
    peer: &'a str,
    data: &'a Value,
}

pub fn encode_login(identity: &PeerId) -> Result<String, CodecError> {
    if identity.as_str().is_empty() {
        return Err(CodecError::InvalidField("login"));
    }
    serde_json::to_string(&LoginFrame {
        signal: LOGIN_KIND,
        login: identity.as_str(),
    })
    .map_err(CodecError::Encode)
}

pub fn encode_signal(kind: SignalKind, peer: &PeerId, data: &Value) -> Result<String, CodecError> {
    if peer.as_str().is_empty() {
        return Err(CodecError::InvalidField("peer"));
    }
    serde_json::to_string(&SignalFrame {
        signal: kind,
        peer: peer.as_str(),
        data,
    })
    .map_err(CodecError::Encode)
}

/// Decodes one relay frame. Unknown fields are ignored; a missing `data`
/// decodes as `null`.
pub fn decode(frame: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(frame).map_err(CodecError::Malformed)?;
    let Value::Object(mut fields) = value else {
        return Err(CodecError::NotAnObject);
    };

    let kind = required_string(&mut fields, "signal")?;
    if kind == LOGIN_KIND {
        let identity = required_string(&mut fields, "login")?;
        return Ok(Envelope::Login(Login {
            identity: PeerId(identity),
        }));
    }

    let kind = SignalKind::from_wire(&kind).ok_or(CodecError::UnknownKind(kind))?;
    let peer = required_string(&mut fields, "peer")?;
    let data = fields.remove("data").unwrap_or(Value::Null);
    Ok(Envelope::Signal(Signal {
        kind,
        peer: PeerId(peer),
        data,
    }))
}

fn required_string(
    fields: &mut Map<String, Value>,
    name: &'static str,
) -> Result<String, CodecError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Err(CodecError::MissingField(name)),
        Some(Value::String(text)) if !text.is_empty() => Ok(text),
        Some(_) => Err(CodecError::InvalidField(name)),
    }
}
