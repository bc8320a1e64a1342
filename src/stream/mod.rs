pub mod backoff;
pub mod manager;
pub mod state;
pub mod websocket;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,
}

/// Lazily produced, possibly infinite sequence of inbound text payloads.
/// Ends when the remote side closes the connection.
pub type PayloadStream = BoxStream<'static, Result<String, StreamError>>;

/// Outbound half of a live connection, driven by the heartbeat task.
#[async_trait]
pub trait HeartbeatSink: Send {
    async fn ping(&mut self) -> Result<(), StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;
}

/// One established connection, split into its two halves.
pub struct Connection {
    pub payloads: PayloadStream,
    pub heartbeat: Box<dyn HeartbeatSink>,
}

/// Opens connections to the event feed.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Connection, StreamError>;
}
