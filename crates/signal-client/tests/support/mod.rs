#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use signal_client::RelayEndpoint;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub enum RelayAction {
    Reply(Value),
    /// Sends raw bytes as a binary frame.
    ReplyBytes(Vec<u8>),
    HangUp,
}

type Script = Arc<dyn Fn(&str, &Value) -> Vec<RelayAction> + Send + Sync>;

#[derive(Clone)]
enum Mode {
    /// Routes each signal to the mailbox of its `peer`, rewriting `peer` to the sender.
    Mailbox,
    /// Answers every frame on the sender's own socket.
    Scripted(Script),
}

/// A frame as seen by the relay, tagged with the sender's login if known.
#[derive(Debug, Clone)]
pub struct ObservedFrame {
    pub from: Option<String>,
    pub frame: Value,
}

/// A close frame received by the relay.
#[derive(Debug, Clone)]
pub struct ObservedClose {
    pub from: Option<String>,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

#[derive(Clone)]
struct RelayState {
    mode: Mode,
    mailboxes: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>>,
    observed: mpsc::UnboundedSender<ObservedFrame>,
    closes: mpsc::UnboundedSender<ObservedClose>,
}

pub struct StubRelay {
    pub addr: SocketAddr,
    observed: mpsc::UnboundedReceiver<ObservedFrame>,
    closes: mpsc::UnboundedReceiver<ObservedClose>,
    server: JoinHandle<()>,
}

impl StubRelay {
    pub async fn mailbox() -> Self {
        Self::start(Mode::Mailbox).await
    }

    pub async fn scripted<F>(script: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<RelayAction> + Send + Sync + 'static,
    {
        Self::start(Mode::Scripted(Arc::new(script))).await
    }

    /// Acks logins and otherwise stays silent.
    pub async fn acking() -> Self {
        Self::scripted(|_, frame| login_ack(frame).into_iter().collect()).await
    }

    async fn start(mode: Mode) -> Self {
        let (observed_tx, observed) = mpsc::unbounded_channel();
        let (closes_tx, closes) = mpsc::unbounded_channel();
        let state = RelayState {
            mode,
            mailboxes: Arc::new(AsyncMutex::new(HashMap::new())),
            observed: observed_tx,
            closes: closes_tx,
        };
        let app = Router::new()
            .route("/signal", get(ws_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay server");
        });
        Self {
            addr,
            observed,
            closes,
            server,
        }
    }

    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::new("ws", self.addr.to_string())
    }

    pub async fn next_observed(&mut self) -> ObservedFrame {
        timeout(STEP, self.observed.recv())
            .await
            .expect("relay observed a frame in time")
            .expect("relay still running")
    }

    pub async fn next_close(&mut self) -> ObservedClose {
        timeout(STEP, self.closes.recv())
            .await
            .expect("relay observed a close in time")
            .expect("relay still running")
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn login_ack(frame: &Value) -> Option<RelayAction> {
    if frame["signal"] == "login" {
        Some(RelayAction::Reply(
            json!({"signal": "login", "login": frame["login"].clone()}),
        ))
    } else {
        None
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut login: Option<String> = None;
    'frames: while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(frame) => {
                let _ = state.closes.send(ObservedClose {
                    from: login.clone(),
                    code: frame.as_ref().map(|frame| frame.code),
                    reason: frame.map(|frame| frame.reason.into_owned()),
                });
                break;
            }
            _ => continue,
        };
        let frame: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let _ = state.observed.send(ObservedFrame {
            from: login.clone(),
            frame: frame.clone(),
        });

        if frame["signal"] == "login" {
            if let Some(id) = frame["login"].as_str() {
                debug!("stub relay: {id} logged in");
                login = Some(id.to_string());
            }
        }

        match &state.mode {
            Mode::Mailbox => {
                if frame["signal"] == "login" {
                    if let Some(id) = &login {
                        state.mailboxes.lock().await.insert(id.clone(), tx.clone());
                        let _ = tx.send(WsMessage::Text(
                            json!({"signal": "login", "login": id}).to_string(),
                        ));
                    }
                    continue;
                }
                let Some(target) = frame["peer"].as_str() else {
                    continue;
                };
                let mut forwarded = frame.clone();
                forwarded["peer"] = json!(login.clone().unwrap_or_default());
                let mailboxes = state.mailboxes.lock().await;
                match mailboxes.get(target) {
                    Some(mailbox) => {
                        let _ = mailbox.send(WsMessage::Text(forwarded.to_string()));
                    }
                    None => debug!("stub relay: no mailbox for {target}"),
                }
            }
            Mode::Scripted(script) => {
                for action in script(login.as_deref().unwrap_or_default(), &frame) {
                    match action {
                        RelayAction::Reply(reply) => {
                            let _ = tx.send(WsMessage::Text(reply.to_string()));
                        }
                        RelayAction::ReplyBytes(bytes) => {
                            let _ = tx.send(WsMessage::Binary(bytes));
                        }
                        RelayAction::HangUp => {
                            let _ = tx.send(WsMessage::Close(None));
                            break 'frames;
                        }
                    }
                }
            }
        }
    }

    if let Some(id) = login {
        state.mailboxes.lock().await.remove(&id);
    }
    drop(tx);
    let _ = send_task.await;
}
