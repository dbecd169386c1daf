use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::ClientError;

/// Order amount limits enforced locally before any frame is sent.
pub const MIN_ORDER_AMOUNT: Decimal = Decimal::ONE;
pub const MAX_ORDER_AMOUNT: Decimal = Decimal::from_parts(50_000, 0, 0, false, 0);

/// Order duration limits in seconds.
pub const MIN_ORDER_DURATION: u32 = 5;
pub const MAX_ORDER_DURATION: u32 = 43_200;

/// Direction of a binary options order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Call,
    Put,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
        }
    }
}

/// Lifecycle of a placed order.
///
/// `ExpiredUnresolved` marks an order whose expiry passed without a settlement
/// push ever arriving. That is a failure of the feed, not a trade outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Settled,
    ExpiredUnresolved,
}

/// A placed order and, once the settlement push arrives, its terminal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub asset: String,
    pub amount: Decimal,
    pub direction: OrderDirection,
    pub duration: u32,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub profit: Option<Decimal>,
    pub payout: Option<Decimal>,
}

impl OrderHandle {
    /// Apply a settlement push. Effectively immutable afterwards.
    pub fn settle(&mut self, profit: Decimal, payout: Option<Decimal>) {
        self.status = OrderStatus::Settled;
        self.profit = Some(profit);
        self.payout = payout;
    }
}

/// Account balance snapshot. Replaced wholesale on every balance push,
/// never patched incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub amount: Decimal,
    pub currency: String,
    pub is_demo: bool,
    pub last_updated: DateTime<Utc>,
}

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
}

/// Historical candle series in strictly increasing timestamp order with no
/// duplicate timestamps. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    pub asset: String,
    /// Timeframe in seconds.
    pub timeframe: u32,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Build a series from raw candles: sorts ascending and drops duplicate
    /// timestamps (first occurrence wins).
    pub fn new(asset: impl Into<String>, timeframe: u32, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Self {
            asset: asset.into(),
            timeframe,
            candles,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Degraded,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Last known health of an endpoint, mutated on connect success/failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Information about the currently (or last) connected endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub url: String,
    pub region: String,
    pub connected_at: DateTime<Utc>,
}

/// Connection statistics maintained across the life of a client.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub total_connections: u64,
    pub successful_connections: u64,
    pub total_reconnects: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connection_start_time: Option<DateTime<Utc>>,
    pub current_region: Option<String>,
}

/// Candle timeframe, always carried as integer seconds internally.
/// Symbolic labels ("1m", "5m", "1h") are accepted only at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeframe(u32);

impl Timeframe {
    pub fn seconds(secs: u32) -> Result<Self, ClientError> {
        if secs == 0 {
            return Err(ClientError::InvalidParameter(
                "timeframe must be positive".to_string(),
            ));
        }
        Ok(Self(secs))
    }

    pub fn parse(label: &str) -> Result<Self, ClientError> {
        normalize_timeframe(label).map(Self)
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }
}

impl From<Timeframe> for u32 {
    fn from(tf: Timeframe) -> Self {
        tf.0
    }
}

/// Normalize a timeframe given either as a symbolic label ("1m", "5m", "1h")
/// or as raw seconds. The core only ever carries integer seconds.
pub fn normalize_timeframe(timeframe: &str) -> Result<u32, ClientError> {
    if let Ok(secs) = timeframe.parse::<u32>() {
        if secs == 0 {
            return Err(ClientError::InvalidParameter(
                "timeframe must be positive".to_string(),
            ));
        }
        return Ok(secs);
    }

    let known = [
        ("1s", 1),
        ("5s", 5),
        ("15s", 15),
        ("30s", 30),
        ("1m", 60),
        ("5m", 300),
        ("15m", 900),
        ("30m", 1_800),
        ("1h", 3_600),
        ("4h", 14_400),
        ("1d", 86_400),
    ];

    known
        .iter()
        .find(|(label, _)| *label == timeframe)
        .map(|(_, secs)| *secs)
        .ok_or_else(|| ClientError::InvalidParameter(format!("Invalid timeframe: {timeframe}")))
}

/// Validate order parameters before any frame is sent.
pub fn validate_order(asset: &str, amount: Decimal, duration: u32) -> Result<(), ClientError> {
    if asset.is_empty() {
        return Err(ClientError::InvalidParameter(
            "asset cannot be empty".to_string(),
        ));
    }
    if amount < MIN_ORDER_AMOUNT || amount > MAX_ORDER_AMOUNT {
        return Err(ClientError::InvalidParameter(format!(
            "amount must be between {MIN_ORDER_AMOUNT} and {MAX_ORDER_AMOUNT}"
        )));
    }
    if !(MIN_ORDER_DURATION..=MAX_ORDER_DURATION).contains(&duration) {
        return Err(ClientError::InvalidParameter(format!(
            "duration must be between {MIN_ORDER_DURATION} and {MAX_ORDER_DURATION} seconds"
        )));
    }
    Ok(())
}
