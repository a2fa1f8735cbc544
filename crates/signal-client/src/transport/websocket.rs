use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::SignalChannel;
use crate::config::RelayEndpoint;
use crate::error::ChannelError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Grace period for the close handshake before the connection is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Websocket connection to the relay.
///
/// Writes go straight to the sink so failures surface on the call that
/// caused them; a reader task drains the stream into a queue so receives
/// can be raced against timeouts without losing frames.
pub struct WebSocketChannel {
    url: Url,
    sink: Option<WsSink>,
    inbound: mpsc::UnboundedReceiver<Result<String, ChannelError>>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketChannel {
    /// Opens the relay connection. Fails fast; retrying is the caller's call.
    pub async fn open(endpoint: &RelayEndpoint) -> Result<Self, ChannelError> {
        let url = endpoint.url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(format!("websocket connect to {url} failed: {err}")))?;
        let (sink, mut stream) = ws_stream.split();

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Ok(text),
                    Ok(Message::Binary(data)) => String::from_utf8(data)
                        .map_err(|err| ChannelError::InvalidFrame(err.to_string())),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => Err(ChannelError::Read(err.to_string())),
                };
                let failed = matches!(frame, Err(ChannelError::Read(_)));
                if inbound_tx.send(frame).is_err() || failed {
                    break;
                }
            }
        });

        Ok(Self {
            url,
            sink: Some(sink),
            inbound,
            reader: Some(reader),
        })
    }

    /// The URL actually dialled, after scheme mapping and localhost rewriting.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SignalChannel for WebSocketChannel {
    async fn send_text(&mut self, frame: String) -> Result<(), ChannelError> {
        let sink = self.sink.as_mut().ok_or(ChannelError::Closed)?;
        sink.send(Message::Text(frame))
            .await
            .map_err(|err| ChannelError::Write(err.to_string()))
    }

    async fn recv_text(&mut self) -> Result<String, ChannelError> {
        if self.sink.is_none() {
            return Err(ChannelError::Closed);
        }
        match self.inbound.recv().await {
            Some(frame) => frame,
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self, reason: &str) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let handshake = async {
            if sink.send(Message::Close(Some(frame))).await.is_ok() {
                let _ = sink.close().await;
            }
        };
        // The peer may already be gone; the connection is released either way.
        let _ = tokio::time::timeout(CLOSE_GRACE, handshake).await;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound.close();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
