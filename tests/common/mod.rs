#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use optionx::core::kernel::{Connector, Transport};
use optionx::{ClientConfig, ClientError, SessionCredentials};

/// Client configuration with timings tightened for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig::new(SessionCredentials::new("test-session"))
        .operation_timeout(Duration::from_secs(2))
        .reconnect_backoff(Duration::from_millis(20), Duration::from_millis(50), 5)
        .rate_limit(100, Duration::from_secs(1))
}

/// In-memory transport wired to a `ServerConn` held by the test.
struct MockTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.to_server
            .send(text)
            .map_err(|_| ClientError::Connection("mock server hung up".to_string()))
    }

    async fn next(&mut self) -> Option<Result<String, ClientError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}

/// The server side of one accepted mock connection. Dropping it simulates a
/// transport-level drop.
pub struct ServerConn {
    pub url: String,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    /// Drive the open/connect/auth handshake to a successful session.
    pub async fn handshake(&mut self) {
        self.handshake_with(true).await;
    }

    pub async fn handshake_with(&mut self, auth_ok: bool) {
        self.send_raw(r#"0{"sid":"mock","pingInterval":25000,"pingTimeout":20000}"#);
        loop {
            let msg = self.rx.recv().await.expect("client hung up during handshake");
            if msg == "40" {
                self.send_raw(r#"40{"sid":"mock"}"#);
            } else if msg.starts_with(r#"42["auth""#) {
                if auth_ok {
                    self.send_event("successauth", json!({}));
                } else {
                    self.send_event("NotAuthorized", json!({"message": "invalid session"}));
                }
                return;
            }
        }
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    pub fn send_event(&self, name: &str, body: Value) {
        let frame = if body.is_null() {
            format!("42[{}]", Value::String(name.to_string()))
        } else {
            format!("42[{},{}]", Value::String(name.to_string()), body)
        };
        let _ = self.tx.send(frame);
    }

    /// Next application event from the client, skipping heartbeats and
    /// protocol acks.
    pub async fn recv_event(&mut self) -> (String, Value) {
        loop {
            let msg = self.rx.recv().await.expect("client hung up");
            if msg == "3" || msg == "40" {
                continue;
            }
            if let Some(body) = msg.strip_prefix("42") {
                let parsed: Value = serde_json::from_str(body).expect("client sent bad frame");
                let arr = parsed.as_array().expect("client event is not an array");
                let name = arr[0].as_str().expect("client event has no name").to_string();
                if name == "ps" {
                    continue;
                }
                return (name, arr.get(1).cloned().unwrap_or(Value::Null));
            }
        }
    }
}

/// Connector producing in-memory connections, handed to the test through an
/// accept queue. URLs can be marked as refusing connections.
pub struct MockConnector {
    refuse: Mutex<HashSet<String>>,
    conn_tx: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                refuse: Mutex::new(HashSet::new()),
                conn_tx,
            }),
            conn_rx,
        )
    }

    pub fn refuse_url(&self, url: &str) {
        self.refuse.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError> {
        if self.refuse.lock().unwrap().contains(url) {
            return Err(ClientError::Connection(format!("unreachable: {url}")));
        }
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        self.conn_tx
            .send(ServerConn {
                url: url.to_string(),
                tx: to_client_tx,
                rx: to_server_rx,
            })
            .map_err(|_| ClientError::Connection("mock accept queue closed".to_string()))?;
        Ok(Box::new(MockTransport {
            to_server: to_server_tx,
            from_server: to_client_rx,
        }))
    }
}
