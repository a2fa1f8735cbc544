use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ChannelError;

/// Path the relay serves its signaling websocket on.
pub const DEFAULT_SIGNAL_PATH: &str = "/signal";

/// Location of the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// `ws` or `wss`; `http`/`https` are accepted and mapped to their websocket form.
    pub scheme: String,
    /// `host[:port]` of the relay.
    pub host: String,
    #[serde(default = "default_signal_path")]
    pub path: String,
}

fn default_signal_path() -> String {
    DEFAULT_SIGNAL_PATH.to_string()
}

impl RelayEndpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: default_signal_path(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Builds the websocket URL, rejecting schemes that cannot carry an upgrade.
    pub fn url(&self) -> Result<Url, ChannelError> {
        let scheme = match self.scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ChannelError::Connect(format!(
                    "unsupported signaling scheme `{other}`"
                )));
            }
        };
        if self.host.trim().is_empty() {
            return Err(ChannelError::Connect("signaling host is empty".into()));
        }

        // Normalize localhost to avoid resolving to ::1 when the relay only binds IPv4.
        let host = if self.host == "localhost" || self.host.starts_with("localhost:") {
            self.host.replacen("localhost", "127.0.0.1", 1)
        } else {
            self.host.clone()
        };

        let mut url = Url::parse(&format!("{scheme}://{host}")).map_err(|err| {
            ChannelError::Connect(format!("invalid signaling host {}: {err}", self.host))
        })?;
        url.set_path(&self.path);
        Ok(url)
    }
}

/// Behaviour of a single [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Read the relay's reply to the login frame before reporting the session ready.
    pub await_login_reply: bool,
    /// Upper bound on that read; when it elapses the session proceeds without an ack.
    pub login_reply_timeout: Option<Duration>,
    /// Reason text carried in the websocket close frame.
    pub close_reason: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            await_login_reply: true,
            login_reply_timeout: Some(Duration::from_secs(5)),
            close_reason: "done".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn without_login_reply(mut self) -> Self {
        self.await_login_reply = false;
        self
    }

    pub fn with_login_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.await_login_reply = true;
        self.login_reply_timeout = timeout;
        self
    }
}

/// Timing policy applied by the [`Negotiator`](crate::negotiation::Negotiator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Bound on each wait for an offer or answer.
    pub signal_timeout: Duration,
    /// Consecutive expired waits tolerated before an offer/answer wait is fatal.
    pub max_idle_waits: u32,
    /// How often the candidate loop re-checks the media layer while the relay is quiet.
    pub candidate_poll_interval: Duration,
    /// Bound on the whole exchange, connect excluded.
    pub negotiation_timeout: Duration,
    /// Treat an undecodable frame as fatal instead of skipping it.
    pub fail_on_malformed: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            signal_timeout: Duration::from_secs(10),
            max_idle_waits: 2,
            candidate_poll_interval: Duration::from_millis(200),
            negotiation_timeout: Duration::from_secs(60),
            fail_on_malformed: false,
        }
    }
}

/// Backoff policy for establishing the relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
