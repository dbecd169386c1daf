pub mod correlator;
pub mod endpoints;
pub mod keepalive;
pub mod rate_limit;
pub mod session;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::client::correlator::{RequestCorrelator, RequestKind};
use crate::client::rate_limit::RateLimiter;
use crate::client::session::SessionStateMachine;
use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::events::{CallbackId, Event, EventCallback, EventDispatcher, EventKind};
use crate::core::kernel::{Connector, Frame, WsConfig, WsConnector};
use crate::core::types::{
    validate_order, Balance, Candle, CandleSeries, ConnectionInfo, ConnectionStats, OrderDirection,
    OrderHandle, OrderStatus, SessionState, Timeframe,
};

/// A cached balance older than this is refreshed from the server.
const BALANCE_CACHE_TTL_SECS: i64 = 60;

/// Grace period after expiry before an unsettled order is declared
/// expired-unresolved.
const SETTLEMENT_GRACE_SECS: i64 = 60;

/// Orders this long past expiry are evicted from the tracking map. Well
/// beyond the settlement grace, so nothing can still happen to them.
const ORDER_RETENTION_SECS: i64 = 3_600;

/// Domain state shared between the facade and the inbound router.
pub(crate) struct ClientState {
    pub is_demo: bool,
    pub balance: RwLock<Option<Balance>>,
    pub orders: RwLock<HashMap<String, OrderHandle>>,
}

impl ClientState {
    /// Drop orders old enough that neither a settlement push nor a status
    /// query can be expected for them. Keeps the map bounded on long-lived
    /// sessions.
    async fn prune_orders(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(ORDER_RETENTION_SECS);
        self.orders.write().await.retain(|_, o| o.expires_at > cutoff);
    }
}

/// Async client for the trading service.
///
/// Independently instantiable: concurrent clients in one process share
/// nothing. Cheap to clone; clones drive the same session.
///
/// Must be created inside a tokio runtime (background tasks are spawned on
/// construction).
#[derive(Clone)]
pub struct OptionClient {
    config: ClientConfig,
    session: Arc<SessionStateMachine>,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<EventDispatcher>,
    limiter: Arc<RateLimiter>,
    shared: Arc<ClientState>,
}

impl OptionClient {
    /// Create a client using the default websocket connector.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector::new(WsConfig::default())))
    }

    /// Create a client over a custom connector. The seam used by tests to
    /// substitute a scripted transport.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let correlator = RequestCorrelator::new();
        let dispatcher = Arc::new(EventDispatcher::new());
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_quota,
            config.rate_limit_window,
        ));
        let shared = Arc::new(ClientState {
            is_demo: config.credentials.is_demo,
            balance: RwLock::new(None),
            orders: RwLock::new(HashMap::new()),
        });
        let session = SessionStateMachine::new(
            config.clone(),
            connector,
            Arc::clone(&correlator),
            Arc::clone(&dispatcher),
            Arc::clone(&shared),
        );
        Self {
            config,
            session,
            correlator,
            dispatcher,
            limiter,
            shared,
        }
    }

    /// Connect and authenticate against the configured regions.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.session.connect(None).await
    }

    /// Connect restricted to the named regions, tried in the given order.
    pub async fn connect_to(&self, regions: Vec<String>) -> Result<(), ClientError> {
        self.session.connect(Some(regions)).await
    }

    /// Disconnect and fail every outstanding request.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.session.state().await == SessionState::Active
    }

    pub async fn state(&self) -> SessionState {
        self.session.state().await
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.session.stats()
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.session.connection_info().await
    }

    /// Current account balance. Served from the last push when fresh,
    /// otherwise requested from the server.
    pub async fn get_balance(&self) -> Result<Balance, ClientError> {
        if let Some(balance) = self.shared.balance.read().await.clone() {
            if Utc::now() - balance.last_updated < ChronoDuration::seconds(BALANCE_CACHE_TTL_SECS) {
                return Ok(balance);
            }
        }

        self.limiter.acquire().await;
        let frame = Frame::event("getBalance", Value::Null).encode();
        let body = self
            .submit(RequestKind::Balance, frame, self.config.retry_reads_after_reconnect)
            .await?;

        // The router stores the push before resolving; fall back to the reply
        // body only if that did not happen.
        if let Some(balance) = self.shared.balance.read().await.clone() {
            return Ok(balance);
        }
        let amount = body
            .get("balance")
            .and_then(Value::as_f64)
            .and_then(|f| Decimal::try_from(f).ok())
            .ok_or_else(|| {
                ClientError::Connection("balance reply missing amount".to_string())
            })?;
        Ok(Balance {
            amount,
            currency: body
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or("USD")
                .to_string(),
            is_demo: self.shared.is_demo,
            last_updated: Utc::now(),
        })
    }

    /// Fetch a historical candle series.
    pub async fn get_candles(
        &self,
        asset: &str,
        timeframe: Timeframe,
        count: usize,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<CandleSeries, ClientError> {
        if asset.is_empty() {
            return Err(ClientError::InvalidParameter(
                "asset cannot be empty".to_string(),
            ));
        }
        if count == 0 {
            return Err(ClientError::InvalidParameter(
                "count must be positive".to_string(),
            ));
        }

        self.limiter.acquire().await;
        let end_ts = end_time.unwrap_or_else(Utc::now).timestamp();
        let frame = Frame::event(
            "loadHistoryPeriod",
            json!({
                "asset": asset,
                "index": end_ts,
                "time": end_ts,
                "offset": count,
                "period": timeframe.as_secs(),
            }),
        )
        .encode();
        let body = self
            .submit(RequestKind::Candles, frame, self.config.retry_reads_after_reconnect)
            .await?;

        let raw = body
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| body.as_array())
            .ok_or_else(|| {
                ClientError::Connection("history reply carried no candle data".to_string())
            })?;
        let mut candles: Vec<Candle> = raw.iter().filter_map(parse_candle).collect();
        // Keep the `count` most recent candles when the server over-delivers.
        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        Ok(CandleSeries::new(asset, timeframe.as_secs(), candles))
    }

    /// Place a binary options order. Resolves once the server acknowledges
    /// the order; settlement arrives later as an `OrderClosed` event.
    #[instrument(skip(self), fields(asset = %asset, direction = %direction))]
    pub async fn place_order(
        &self,
        asset: &str,
        amount: Decimal,
        direction: OrderDirection,
        duration: u32,
    ) -> Result<OrderHandle, ClientError> {
        validate_order(asset, amount, duration)?;

        self.limiter.acquire().await;
        let key = self.correlator.allocate_key();
        let frame = Frame::event(
            "openOrder",
            json!({
                "asset": asset,
                "amount": amount.to_f64().unwrap_or_default(),
                "action": direction.to_string(),
                "isDemo": u8::from(self.shared.is_demo),
                "requestId": key,
                "optionType": 100,
                "time": duration,
            }),
        )
        .encode();

        let rx = self
            .correlator
            .register(key, RequestKind::Order, frame.clone(), self.config.operation_timeout, false)
            .await;
        if let Err(e) = self.session.send(frame).await {
            self.correlator.resolve(key, Err(e)).await;
        }
        let body = rx
            .await
            .map_err(|_| ClientError::Connection("request dropped".to_string()))??;

        let order_id = body
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| ClientError::Order("order reply carried no id".to_string()))?;
        let placed_at = Utc::now();
        let order = OrderHandle {
            order_id: order_id.clone(),
            asset: asset.to_string(),
            amount,
            direction,
            duration,
            status: OrderStatus::Open,
            placed_at,
            expires_at: placed_at + ChronoDuration::seconds(i64::from(duration)),
            profit: None,
            payout: None,
        };
        self.shared
            .orders
            .write()
            .await
            .insert(order_id, order.clone());
        self.shared.prune_orders().await;
        info!(order_id = %order.order_id, "order accepted");
        self.dispatcher.emit(&Event::OrderOpened(order.clone())).await;
        Ok(order)
    }

    /// Current view of a placed order. An open order whose expiry passed
    /// without a settlement push is reported expired-unresolved.
    pub async fn check_order_result(&self, order_id: &str) -> Option<OrderHandle> {
        let mut orders = self.shared.orders.write().await;
        let order = orders.get_mut(order_id)?;
        if order.status == OrderStatus::Open
            && Utc::now() > order.expires_at + ChronoDuration::seconds(SETTLEMENT_GRACE_SECS)
        {
            order.status = OrderStatus::ExpiredUnresolved;
        }
        Some(order.clone())
    }

    /// All orders still awaiting settlement.
    pub async fn get_active_orders(&self) -> Vec<OrderHandle> {
        self.shared
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    /// Send a pre-encoded frame through the active connection.
    pub async fn send_raw_message(&self, message: &str) -> Result<(), ClientError> {
        self.limiter.acquire().await;
        self.session.send(message.to_string()).await
    }

    pub async fn add_event_callback(&self, kind: EventKind, callback: EventCallback) -> CallbackId {
        self.dispatcher.add_callback(kind, callback).await
    }

    pub async fn remove_event_callback(&self, kind: EventKind, id: CallbackId) {
        self.dispatcher.remove_callback(kind, id).await
    }

    /// Register a pending request, send its frame and await the correlated
    /// reply body.
    async fn submit(
        &self,
        kind: RequestKind,
        frame: String,
        retryable: bool,
    ) -> Result<Value, ClientError> {
        let key = self.correlator.allocate_key();
        let rx = self
            .correlator
            .register(key, kind, frame.clone(), self.config.operation_timeout, retryable)
            .await;
        if let Err(e) = self.session.send(frame).await {
            self.correlator.resolve(key, Err(e)).await;
        }
        rx.await
            .map_err(|_| ClientError::Connection("request dropped".to_string()))?
    }
}

fn parse_candle(value: &Value) -> Option<Candle> {
    let num = |v: &Value| v.as_f64().and_then(|f| Decimal::try_from(f).ok());

    if let Some(obj) = value.as_object() {
        let ts = obj
            .get("time")
            .or_else(|| obj.get("timestamp"))
            .and_then(Value::as_i64)?;
        Some(Candle {
            timestamp: DateTime::from_timestamp(ts, 0)?,
            open: num(obj.get("open")?)?,
            high: num(obj.get("high")?)?,
            low: num(obj.get("low")?)?,
            close: num(obj.get("close")?)?,
            volume: obj.get("volume").and_then(|v| num(v)),
        })
    } else if let Some(arr) = value.as_array() {
        // Compact form: [timestamp, open, high, low, close, volume?]
        if arr.len() < 5 {
            return None;
        }
        Some(Candle {
            timestamp: DateTime::from_timestamp(arr[0].as_i64()?, 0)?,
            open: num(&arr[1])?,
            high: num(&arr[2])?,
            low: num(&arr[3])?,
            close: num(&arr[4])?,
            volume: arr.get(5).and_then(|v| num(v)),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, status: OrderStatus, expires_at: DateTime<Utc>) -> OrderHandle {
        OrderHandle {
            order_id: id.to_string(),
            asset: "EURUSD".to_string(),
            amount: Decimal::TEN,
            direction: OrderDirection::Call,
            duration: 60,
            status,
            placed_at: expires_at - ChronoDuration::seconds(60),
            expires_at,
            profit: None,
            payout: None,
        }
    }

    #[tokio::test]
    async fn orders_past_retention_are_evicted() {
        let state = ClientState {
            is_demo: true,
            balance: RwLock::new(None),
            orders: RwLock::new(HashMap::new()),
        };
        let stale = Utc::now() - ChronoDuration::seconds(ORDER_RETENTION_SECS + 60);
        let fresh = Utc::now() + ChronoDuration::seconds(60);
        {
            let mut orders = state.orders.write().await;
            orders.insert("old-settled".into(), order("old-settled", OrderStatus::Settled, stale));
            orders.insert("old-open".into(), order("old-open", OrderStatus::Open, stale));
            orders.insert("live".into(), order("live", OrderStatus::Open, fresh));
        }

        state.prune_orders().await;

        let orders = state.orders.read().await;
        assert_eq!(orders.len(), 1);
        assert!(orders.contains_key("live"));
    }

    #[test]
    fn parses_object_and_array_candles() {
        let obj = json!({"time": 100, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5});
        let arr = json!([100, 1.0, 2.0, 0.5, 1.5, 42.0]);
        let c1 = parse_candle(&obj).unwrap();
        let c2 = parse_candle(&arr).unwrap();
        assert_eq!(c1.timestamp, c2.timestamp);
        assert_eq!(c2.volume, Some(Decimal::try_from(42.0).unwrap()));
        assert!(parse_candle(&json!("nope")).is_none());
        assert!(parse_candle(&json!([100, 1.0])).is_none());
    }
}
