use super::{Connection, HeartbeatSink, StreamConnector, StreamError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport parameters for the inbound feed.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    pub url: String,
    pub connect_timeout: Duration,
    /// Longest silence (no frame of any kind, pongs included) before the
    /// connection is treated as dead.
    pub idle_timeout: Duration,
    pub max_message_size: usize,
    /// Inbound payloads buffered ahead of the read loop.
    pub max_queue: usize,
}

pub struct WebSocketConnector {
    settings: WebSocketSettings,
}

impl WebSocketConnector {
    pub fn new(settings: WebSocketSettings) -> Self {
        Self { settings }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.settings.max_message_size);
        config.max_frame_size = Some(self.settings.max_message_size);
        config
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, StreamError> {
        let handshake =
            connect_async_with_config(self.settings.url.as_str(), Some(self.ws_config()), true);

        let (socket, response) = tokio::time::timeout(self.settings.connect_timeout, handshake)
            .await
            .map_err(|_| StreamError::Timeout(self.settings.connect_timeout))?
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(self.settings.max_queue.max(1));
        tokio::spawn(pump_frames(stream, tx, self.settings.idle_timeout));

        Ok(Connection {
            payloads: ReceiverStream::new(rx).boxed(),
            heartbeat: Box::new(WebSocketHeartbeat { sink }),
        })
    }
}

/// Forward text payloads from the socket into the bounded inbound queue.
///
/// Ends on remote close, on the first transport error (which is forwarded),
/// on idle timeout, or once the consumer has dropped its end.
async fn pump_frames(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<Result<String, StreamError>>,
    idle_timeout: Duration,
) {
    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                let _ = tx.send(Err(StreamError::Timeout(idle_timeout))).await;
                return;
            }
        };

        let item = match frame {
            None => return,
            Some(Ok(Message::Text(text))) => Ok(text),
            Some(Ok(Message::Binary(bytes))) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "server closed the websocket");
                return;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Err(e)) => Err(StreamError::Protocol(e.to_string())),
        };

        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Application-level liveness ping understood by the feed.
pub fn heartbeat_payload(now: DateTime<Utc>) -> String {
    let timestamp = now.timestamp_millis() as f64 / 1000.0;
    serde_json::json!({ "type": "ping", "timestamp": timestamp }).to_string()
}

struct WebSocketHeartbeat {
    sink: SplitSink<WsStream, Message>,
}

/// Sends a protocol ping, whose pong keeps a quiet feed under the idle
/// timeout, followed by the feed's own JSON ping.
#[async_trait]
impl HeartbeatSink for WebSocketHeartbeat {
    async fn ping(&mut self) -> Result<(), StreamError> {
        self.sink
            .feed(Message::Ping(Vec::new()))
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))?;
        self.sink
            .send(Message::Text(heartbeat_payload(Utc::now())))
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.sink
            .close()
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))
    }
}
