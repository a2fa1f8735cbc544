use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use signal_client::{
    PeerId, RelayEndpoint, RetryPolicy, Session, SessionConfig, SessionContext, SessionError,
    SignalKind, WebSocketChannel, events::tracing_observer, negotiation::connect_with_retry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "signal-peer",
    author,
    version,
    about = "Drive a signaling relay by hand: send offers and candidates, or wait for them"
)]
struct Cli {
    /// Relay `host:port`.
    #[arg(long, env = "SIGNAL_RELAY_ADDR", default_value = "127.0.0.1:8080")]
    relay: String,

    /// `ws`, `wss`, `http` or `https`.
    #[arg(long, env = "SIGNAL_RELAY_SCHEME", default_value = "ws")]
    scheme: String,

    /// Identity to log in as.
    #[arg(long, env = "SIGNAL_LOGIN")]
    login: String,

    /// Connect attempts before giving up.
    #[arg(long, default_value_t = 3)]
    connect_attempts: u32,

    /// Seconds to wait for the relay to acknowledge the login; 0 skips the wait.
    #[arg(long, default_value_t = 5)]
    login_reply_secs: u64,

    /// Emit session events on stderr.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send an offer and print the answer.
    Offer {
        #[arg(long)]
        peer: String,
        /// JSON payload.
        #[arg(long)]
        data: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Send one or more candidates, in order.
    Candidate {
        #[arg(long)]
        peer: String,
        /// JSON payload; repeat for several candidates.
        #[arg(long = "data", required = true)]
        data: Vec<String>,
    },
    /// Wait for an offer, answer it, then print signals until interrupted.
    Listen {
        /// JSON answer payload sent back for the first offer.
        #[arg(long)]
        answer: String,
        /// Peer to answer; defaults to the `peer` named in the offer.
        #[arg(long)]
        reply_to: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct PeerConfig {
    endpoint: RelayEndpoint,
    identity: PeerId,
    session: SessionConfig,
    retry: RetryPolicy,
}

impl TryFrom<&Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let endpoint = RelayEndpoint::new(cli.scheme.clone(), cli.relay.clone());
        endpoint
            .url()
            .with_context(|| format!("invalid relay {}://{}", cli.scheme, cli.relay))?;
        if cli.login.trim().is_empty() {
            bail!("login must not be empty");
        }
        let session = if cli.login_reply_secs == 0 {
            SessionConfig::default().without_login_reply()
        } else {
            SessionConfig::default()
                .with_login_reply_timeout(Some(Duration::from_secs(cli.login_reply_secs)))
        };
        Ok(PeerConfig {
            endpoint,
            identity: PeerId::from(cli.login.as_str()),
            session,
            retry: RetryPolicy {
                max_attempts: cli.connect_attempts.max(1),
                ..RetryPolicy::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose)?;
    let config = PeerConfig::try_from(&cli)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut session = connect(&config, &cancel).await?;
    let result = run(&mut session, cli.command).await;
    session.close().await;
    result
}

async fn connect(
    config: &PeerConfig,
    cancel: &CancellationToken,
) -> Result<Session<WebSocketChannel>> {
    let observer = tracing_observer();
    let context = SessionContext::new(config.session.clone())
        .with_observer(observer.clone())
        .with_cancel(cancel.clone());
    let session = connect_with_retry(&config.retry, &observer, cancel, || {
        Session::connect(&config.endpoint, config.identity.clone(), context.clone())
    })
    .await
    .with_context(|| {
        format!(
            "failed to log in to {} as {}",
            config.endpoint.host, config.identity
        )
    })?;
    info!(identity = %config.identity, relay = %config.endpoint.host, "logged in");
    Ok(session)
}

async fn run(session: &mut Session<WebSocketChannel>, command: Command) -> Result<()> {
    match command {
        Command::Offer {
            peer,
            data,
            timeout_secs,
        } => {
            let offer = parse_payload(&data)?;
            let answer = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                session.send_offer(&PeerId::from(peer), &offer),
            )
            .await
            .context("timed out waiting for an answer")?
            .context("offer failed")?;
            if answer.kind != SignalKind::Answer {
                warn!(kind = %answer.kind, "reply to offer was not an answer");
            }
            print_signal(answer.kind, &answer.peer, &answer.data)
        }
        Command::Candidate { peer, data } => {
            let peer = PeerId::from(peer);
            for raw in data {
                let candidate = parse_payload(&raw)?;
                session
                    .send_candidate(&peer, &candidate)
                    .await
                    .context("failed to send candidate")?;
            }
            Ok(())
        }
        Command::Listen { answer, reply_to } => {
            let answer = parse_payload(&answer)?;
            let mut answered = false;
            loop {
                let signal = match session.wait_for_signal().await {
                    Ok(signal) => signal,
                    Err(SessionError::Decode(err)) => {
                        warn!(error = %err, "skipping malformed frame");
                        continue;
                    }
                    Err(SessionError::Closed) => return Ok(()),
                    Err(err) => return Err(err).context("relay connection failed"),
                };
                print_signal(signal.kind, &signal.peer, &signal.data)?;
                if signal.kind == SignalKind::Offer && !answered {
                    let target = reply_to
                        .clone()
                        .map(PeerId::from)
                        .unwrap_or_else(|| signal.peer.clone());
                    session
                        .send_answer(&target, &answer)
                        .await
                        .context("failed to send answer")?;
                    answered = true;
                }
            }
        }
    }
}

fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("payload is not valid JSON: {raw}"))
}

fn print_signal(kind: SignalKind, peer: &PeerId, data: &Value) -> Result<()> {
    let line = serde_json::json!({"signal": kind, "peer": peer, "data": data});
    println!("{}", serde_json::to_string(&line).context("failed to render signal")?);
    Ok(())
}
