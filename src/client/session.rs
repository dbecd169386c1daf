use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, instrument, warn};

use crate::client::correlator::{RequestCorrelator, RequestKind};
use crate::client::endpoints::{default_endpoints, Endpoint, EndpointSelector};
use crate::client::keepalive::{ActivityTracker, KeepAliveScheduler};
use crate::client::ClientState;
use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::events::{Event, EventDispatcher};
use crate::core::kernel::{Connector, Frame, FrameBuffer, Transport};
use crate::core::types::{Balance, ConnectionInfo, ConnectionStats, SessionState};

/// Everything the inbound router needs to act on a decoded frame.
#[derive(Clone)]
pub(crate) struct RouterCtx {
    pub correlator: Arc<RequestCorrelator>,
    pub dispatcher: Arc<EventDispatcher>,
    pub shared: Arc<ClientState>,
    pub outbound: mpsc::UnboundedSender<String>,
    pub activity: ActivityTracker,
    pub degrade: Arc<Notify>,
    pub stats: Arc<StdMutex<ConnectionStats>>,
}

struct ActiveConnection {
    outbound: mpsc::UnboundedSender<String>,
    io_task: JoinHandle<()>,
    keepalive: KeepAliveScheduler,
    info: ConnectionInfo,
}

// A replaced connection must not keep routing frames.
impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

/// Owns the physical connection and the session lifecycle.
///
/// All transport access flows through this type: callers send frames through
/// `send`, inbound frames are routed by the single io task, and state changes
/// are observable only through the event dispatcher.
pub struct SessionStateMachine {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<EventDispatcher>,
    shared: Arc<ClientState>,
    state: RwLock<SessionState>,
    selector: Mutex<EndpointSelector>,
    conn: Mutex<Option<ActiveConnection>>,
    /// Serializes connection establishment between `connect` callers and the
    /// recovery supervisor.
    connect_gate: Mutex<()>,
    stats: Arc<StdMutex<ConnectionStats>>,
    degrade: Arc<Notify>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStateMachine {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        correlator: Arc<RequestCorrelator>,
        dispatcher: Arc<EventDispatcher>,
        shared: Arc<ClientState>,
    ) -> Arc<Self> {
        let endpoints = default_endpoints(config.credentials.is_demo);
        let selector = EndpointSelector::filtered(endpoints, &config.preferred_regions);
        Arc::new(Self {
            config,
            connector,
            correlator,
            dispatcher,
            shared,
            state: RwLock::new(SessionState::Disconnected),
            selector: Mutex::new(selector),
            conn: Mutex::new(None),
            connect_gate: Mutex::new(()),
            stats: Arc::new(StdMutex::new(ConnectionStats::default())),
            degrade: Arc::new(Notify::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.conn.lock().await.as_ref().map(|c| c.info.clone())
    }

    /// Connect and authenticate, cycling through candidate endpoints.
    #[instrument(skip(self, regions))]
    pub async fn connect(self: &Arc<Self>, regions: Option<Vec<String>>) -> Result<(), ClientError> {
        let _gate = self.connect_gate.lock().await;
        if self.state().await == SessionState::Active {
            return Ok(());
        }
        if let Some(regions) = regions {
            let endpoints = default_endpoints(self.config.credentials.is_demo);
            *self.selector.lock().await = EndpointSelector::filtered(endpoints, &regions);
        }
        self.establish().await?;
        // The supervisor also drives the no-reconnect teardown path, so it
        // runs regardless of the auto-reconnect setting.
        self.ensure_supervisor().await;
        Ok(())
    }

    /// Explicit disconnect: cancels background tasks, fails every pending
    /// request and releases the transport. Terminal.
    pub async fn disconnect(&self) {
        info!("disconnecting session");
        self.set_state(SessionState::Closed).await;
        // Wake the supervisor so it observes Closed before being dropped.
        self.degrade.notify_one();
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        self.teardown_connection().await;
        self.correlator.fail_all("client disconnected", false).await;
        self.dispatcher.emit(&Event::Disconnected).await;
    }

    /// Send an encoded frame through the active connection.
    pub async fn send(&self, text: String) -> Result<(), ClientError> {
        let state = self.state().await;
        if state != SessionState::Active {
            return Err(ClientError::Connection(format!("session is {state}")));
        }
        let conn = self.conn.lock().await;
        let conn = conn
            .as_ref()
            .ok_or_else(|| ClientError::Connection("no active connection".to_string()))?;
        conn.outbound
            .send(text)
            .map_err(|_| ClientError::Connection("connection closed".to_string()))?;
        self.stats.lock().expect("stats lock poisoned").messages_sent += 1;
        Ok(())
    }

    /// One full pass over the endpoint list. Leaves the session Active on
    /// success, Disconnected on failure.
    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        self.set_state(SessionState::Connecting).await;
        self.selector.lock().await.reset();

        let mut last_err = ClientError::Connection("no endpoints available".to_string());
        let mut attempts = 0u32;
        while attempts < self.config.max_connect_attempts {
            let endpoint = self.selector.lock().await.next();
            let Some(endpoint) = endpoint else { break };
            attempts += 1;

            match self.attempt_endpoint(&endpoint).await {
                Ok(conn) => {
                    self.selector.lock().await.mark_success(&endpoint.url);
                    let region = conn.info.region.clone();
                    {
                        let mut stats = self.stats.lock().expect("stats lock poisoned");
                        stats.successful_connections += 1;
                        stats.connection_start_time = Some(Utc::now());
                        stats.current_region = Some(region.clone());
                    }
                    *self.conn.lock().await = Some(conn);
                    self.set_state(SessionState::Active).await;
                    info!(%region, "session active");
                    self.dispatcher.emit(&Event::Connected { region }).await;
                    self.dispatcher.emit(&Event::Authenticated).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(region = %endpoint.region, error = %e, "endpoint attempt failed");
                    self.selector.lock().await.mark_failure(&endpoint.url);
                    self.set_state(SessionState::Connecting).await;
                    last_err = e;
                }
            }
        }

        self.set_state(SessionState::Disconnected).await;
        Err(last_err)
    }

    /// Dial one endpoint, run the authentication handshake and start the io
    /// and keep-alive tasks.
    async fn attempt_endpoint(
        self: &Arc<Self>,
        endpoint: &Endpoint,
    ) -> Result<ActiveConnection, ClientError> {
        debug!(region = %endpoint.region, url = %endpoint.url, "connecting");
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .total_connections += 1;

        let mut transport = self.connector.connect(&endpoint.url).await?;
        self.set_state(SessionState::Authenticating).await;

        let auth_frame = Frame::event("auth", self.config.credentials.auth_body()).encode();
        tokio::time::timeout(
            self.config.auth_timeout,
            handshake(transport.as_mut(), &auth_frame),
        )
        .await
        .map_err(|_| {
            ClientError::Authentication("no authentication reply within deadline".to_string())
        })??;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::new();
        let ctx = RouterCtx {
            correlator: Arc::clone(&self.correlator),
            dispatcher: Arc::clone(&self.dispatcher),
            shared: Arc::clone(&self.shared),
            outbound: outbound_tx.clone(),
            activity: activity.clone(),
            degrade: Arc::clone(&self.degrade),
            stats: Arc::clone(&self.stats),
        };
        let io_task = spawn_io(transport, outbound_rx, ctx);
        let keepalive = KeepAliveScheduler::spawn(
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout_multiplier,
            outbound_tx.clone(),
            activity,
            Arc::clone(&self.degrade),
        );

        Ok(ActiveConnection {
            outbound: outbound_tx,
            io_task,
            keepalive,
            info: ConnectionInfo {
                url: endpoint.url.clone(),
                region: endpoint.region.clone(),
                connected_at: Utc::now(),
            },
        })
    }

    async fn ensure_supervisor(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let session = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                session.degrade.notified().await;
                if session.state().await == SessionState::Closed {
                    break;
                }
                if !session.recover().await {
                    break;
                }
            }
        }));
    }

    /// Degraded-connection recovery: tear down, then reconnect with bounded
    /// exponential backoff. Returns false once the session is Closed.
    async fn recover(self: &Arc<Self>) -> bool {
        let _gate = self.connect_gate.lock().await;
        if self.state().await != SessionState::Active {
            return true;
        }
        warn!("session degraded");
        self.set_state(SessionState::Degraded).await;
        self.teardown_connection().await;

        if !self.config.auto_reconnect {
            self.dispatcher.emit(&Event::Disconnected).await;
            self.fail_and_close("connection lost").await;
            return false;
        }

        self.set_state(SessionState::Reconnecting).await;
        self.dispatcher.emit(&Event::Disconnected).await;
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .total_reconnects += 1;

        // Pending requests that cannot survive the reconnect fail now;
        // retryable read-only queries keep their slots and are replayed.
        let retained = self
            .correlator
            .fail_all("connection lost", self.config.retry_reads_after_reconnect)
            .await;

        let mut attempt = 0u32;
        for delay in backoff_delays(&self.config) {
            attempt += 1;
            self.dispatcher.emit(&Event::Reconnecting { attempt }).await;
            tokio::time::sleep(delay).await;

            match self.establish().await {
                Ok(()) => {
                    let region = self
                        .connection_info()
                        .await
                        .map(|i| i.region)
                        .unwrap_or_default();
                    for frame in &retained {
                        if let Err(e) = self.send(frame.clone()).await {
                            warn!(error = %e, "failed to replay retained request");
                        }
                    }
                    info!(%region, attempt, "reconnected");
                    self.dispatcher.emit(&Event::Reconnected { region }).await;
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    self.set_state(SessionState::Reconnecting).await;
                }
            }
        }

        self.fail_and_close("reconnect attempts exhausted").await;
        false
    }

    async fn fail_and_close(&self, reason: &str) {
        self.teardown_connection().await;
        self.correlator.fail_all(reason, false).await;
        self.set_state(SessionState::Closed).await;
        warn!(reason, "session closed");
    }

    async fn teardown_connection(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.keepalive.cancel();
            conn.io_task.abort();
        }
    }

    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!(from = %*state, to = %next, "session state transition");
            *state = next;
        }
    }
}

/// Sequence of reconnect delays: doubling from the configured base, capped,
/// bounded by the attempt ceiling. Pure data, independently testable.
pub(crate) fn backoff_delays(
    config: &ClientConfig,
) -> impl Iterator<Item = std::time::Duration> + '_ {
    let base_ms = config.reconnect_base_delay.as_millis().max(2) as u64;
    ExponentialBackoff::from_millis(2)
        .factor(base_ms / 2)
        .max_delay(config.reconnect_max_delay)
        .take(config.max_reconnect_attempts as usize)
}

/// Run the open / connect / authenticate sequence on a fresh transport.
async fn handshake(transport: &mut dyn Transport, auth_frame: &str) -> Result<(), ClientError> {
    let mut buffer = FrameBuffer::new();
    loop {
        let raw = match transport.next().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ClientError::Connection(
                    "connection closed during handshake".to_string(),
                ));
            }
        };
        for frame in buffer.push(&raw)? {
            match frame {
                Frame::Open(_) => {
                    transport.send(Frame::ConnectAck(None).encode()).await?;
                }
                Frame::ConnectAck(_) => {
                    transport.send(auth_frame.to_string()).await?;
                }
                Frame::Ping => {
                    transport.send(Frame::Pong.encode()).await?;
                }
                Frame::Event { ref name, ref body } => match name.as_str() {
                    "successauth" => return Ok(()),
                    "autherror" | "NotAuthorized" => {
                        return Err(ClientError::Authentication(
                            body.get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("credentials rejected")
                                .to_string(),
                        ));
                    }
                    _ => debug!(event = %name, "frame before authentication"),
                },
                _ => {}
            }
        }
    }
}

/// The single connection task: owns the transport, multiplexes outbound
/// frames and inbound routing. Inbound frames are processed strictly in
/// arrival order.
fn spawn_io(
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ctx: RouterCtx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = FrameBuffer::new();
        loop {
            tokio::select! {
                out = outbound_rx.recv() => match out {
                    Some(text) => {
                        if let Err(e) = transport.send(text).await {
                            warn!(error = %e, "outbound send failed");
                            ctx.degrade.notify_one();
                            break;
                        }
                    }
                    None => {
                        transport.close().await;
                        break;
                    }
                },
                msg = transport.next() => match msg {
                    Some(Ok(text)) => {
                        ctx.activity.touch();
                        ctx.stats
                            .lock()
                            .expect("stats lock poisoned")
                            .messages_received += 1;
                        match buffer.push(&text) {
                            Ok(frames) => {
                                for frame in frames {
                                    route_frame(&ctx, frame).await;
                                }
                            }
                            Err(e) => {
                                // Malformed wire data is recoverable: drop
                                // the connection and let recovery rebuild it.
                                warn!(error = %e, "framing error, degrading");
                                ctx.degrade.notify_one();
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        ctx.degrade.notify_one();
                        break;
                    }
                    None => {
                        debug!("transport closed by peer");
                        ctx.degrade.notify_one();
                        break;
                    }
                },
            }
        }
    })
}

pub(crate) async fn route_frame(ctx: &RouterCtx, frame: Frame) {
    match frame {
        Frame::Ping => {
            ctx.stats
                .lock()
                .expect("stats lock poisoned")
                .last_heartbeat = Some(Utc::now());
            let _ = ctx.outbound.send(Frame::Pong.encode());
        }
        Frame::Pong | Frame::Open(_) | Frame::ConnectAck(_) => {}
        Frame::Close => ctx.degrade.notify_one(),
        Frame::Event { name, body } => route_event(ctx, &name, body).await,
    }
}

async fn route_event(ctx: &RouterCtx, name: &str, body: Value) {
    match name {
        "successauth" => debug!("authentication confirmed"),
        "successupdateBalance" | "updateBalance" => handle_balance_push(ctx, &body).await,
        "successopenOrder" => resolve_keyed(ctx, RequestKind::Order, body, None).await,
        "failopenOrder" => {
            let err = ClientError::Order(
                body.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("order rejected by server")
                    .to_string(),
            );
            resolve_keyed(ctx, RequestKind::Order, body, Some(err)).await;
        }
        "successcloseOrder" => handle_settlement_push(ctx, &body).await,
        "loadHistoryPeriod" | "updateHistoryNew" => {
            if !ctx
                .correlator
                .resolve_oldest(RequestKind::Candles, Ok(body))
                .await
            {
                debug!("history reply with no outstanding request");
            }
        }
        "updateStream" => {}
        "autherror" | "NotAuthorized" => {
            warn!("session no longer authorized");
            ctx.degrade.notify_one();
        }
        other => debug!(event = other, "unhandled push"),
    }
}

/// Replies that embed the correlation key resolve directly; the rest fall
/// back to oldest-of-kind.
async fn resolve_keyed(ctx: &RouterCtx, kind: RequestKind, body: Value, err: Option<ClientError>) {
    let key = body.get("requestId").and_then(Value::as_u64);
    let result = match err {
        Some(e) => Err(e),
        None => Ok(body),
    };
    match key {
        Some(key) => ctx.correlator.resolve(key, result).await,
        None => {
            ctx.correlator.resolve_oldest(kind, result).await;
        }
    }
}

async fn handle_balance_push(ctx: &RouterCtx, body: &Value) {
    let Some(amount) = body
        .get("balance")
        .and_then(Value::as_f64)
        .and_then(|f| Decimal::try_from(f).ok())
    else {
        warn!("balance push without a numeric balance field");
        return;
    };
    let balance = Balance {
        amount,
        currency: body
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_string(),
        is_demo: ctx.shared.is_demo,
        last_updated: Utc::now(),
    };

    // Wholesale replacement: the push is the authoritative snapshot.
    *ctx.shared.balance.write().await = Some(balance.clone());
    ctx.correlator
        .resolve_oldest(RequestKind::Balance, Ok(body.clone()))
        .await;
    ctx.dispatcher.emit(&Event::BalanceUpdated(balance)).await;
}

async fn handle_settlement_push(ctx: &RouterCtx, body: &Value) {
    let deals: Vec<&Value> = match body.get("deals").and_then(Value::as_array) {
        Some(deals) => deals.iter().collect(),
        None => vec![body],
    };

    for deal in deals {
        let Some(order_id) = deal_id(deal) else {
            continue;
        };
        let profit = deal
            .get("profit")
            .and_then(Value::as_f64)
            .and_then(|f| Decimal::try_from(f).ok())
            .unwrap_or_default();
        let payout = deal
            .get("payout")
            .and_then(Value::as_f64)
            .and_then(|f| Decimal::try_from(f).ok());

        let settled = {
            let mut orders = ctx.shared.orders.write().await;
            orders.get_mut(&order_id).map(|order| {
                order.settle(profit, payout);
                order.clone()
            })
        };
        match settled {
            Some(order) => ctx.dispatcher.emit(&Event::OrderClosed(order)).await,
            None => debug!(%order_id, "settlement for unknown order"),
        }
    }
}

fn deal_id(deal: &Value) -> Option<String> {
    match deal.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::config::SessionCredentials;

    fn config() -> ClientConfig {
        ClientConfig::new(SessionCredentials::new("token"))
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let config = config()
            .reconnect_backoff(Duration::from_secs(1), Duration::from_secs(8), 6);
        let delays: Vec<Duration> = backoff_delays(&config).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn backoff_respects_attempt_ceiling() {
        let config = config()
            .reconnect_backoff(Duration::from_millis(100), Duration::from_secs(60), 3);
        assert_eq!(backoff_delays(&config).count(), 3);
    }
}
