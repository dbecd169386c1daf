use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::instrument;

use crate::core::errors::ClientError;

/// Transport-level configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One established duplex text connection. Pure transport: framing and
/// protocol semantics live above this seam.
#[async_trait]
pub trait Transport: Send {
    /// Send one text payload.
    async fn send(&mut self, text: String) -> Result<(), ClientError>;

    /// Receive the next text payload. `None` means the peer closed.
    async fn next(&mut self) -> Option<Result<String, ClientError>>;

    /// Close the connection.
    async fn close(&mut self);
}

/// Dials endpoints and produces transports. The seam that tests replace with
/// a scripted in-memory implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError>;
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Tungstenite-backed transport.
pub struct TungsteniteTransport {
    write: WsSink,
    read: WsStream,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Connection(format!("send failed: {e}")))
    }

    async fn next(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // The wire protocol runs its own heartbeat inside text
                // frames; websocket-level control frames are transport noise.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    return Some(Err(ClientError::Connection(format!(
                        "websocket error: {e}"
                    ))));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}

/// Default connector dialing `wss://` endpoints with a connect timeout.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsConfig,
}

impl WsConnector {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError> {
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::Connection("connection timeout".to_string()))?
            .map_err(|e| ClientError::Connection(format!("connection failed: {e}")))?;

        let (write, read) = ws_stream.split();
        Ok(Box::new(TungsteniteTransport { write, read }))
    }
}
