use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLCV candlestick for one closed interval of the monitored market
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Kline interval as understood by the exchange ("1m", "5m", "1h", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KlineInterval {
    seconds: i64,
}

impl KlineInterval {
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    pub fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds.max(0) as u64)
    }
}

impl FromStr for KlineInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 2 {
            return Err(format!("invalid kline interval '{}'", s));
        }
        let (amount, unit) = s.split_at(s.len() - 1);
        let amount: i64 = amount
            .parse()
            .map_err(|_| format!("invalid kline interval '{}'", s))?;
        if amount <= 0 {
            return Err(format!("kline interval must be positive, got '{}'", s));
        }
        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            _ => return Err(format!("unknown kline interval unit in '{}'", s)),
        };
        Ok(Self {
            seconds: amount * unit_secs,
        })
    }
}

impl TryFrom<String> for KlineInterval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KlineInterval> for String {
    fn from(value: KlineInterval) -> Self {
        value.to_string()
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 604_800 == 0 {
            write!(f, "{}w", s / 604_800)
        } else if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}

/// Direction of the position held on the execution market
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
    #[default]
    Flat,
}

impl PositionSide {
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
            PositionSide::Flat => PositionSide::Flat,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order_side(self) -> Option<OrderSide> {
        match self {
            PositionSide::Long => Some(OrderSide::Buy),
            PositionSide::Short => Some(OrderSide::Sell),
            PositionSide::Flat => None,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Flat => write!(f, "FLAT"),
        }
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(PositionSide::Long),
            "short" | "sell" => Ok(PositionSide::Short),
            "flat" => Ok(PositionSide::Flat),
            other => Err(format!("unknown position side '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Isolated,
    Cross,
}

impl MarginMode {
    /// Wire value for the futures margin type endpoint
    pub fn as_exchange_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSSED",
        }
    }
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarginMode::Isolated => write!(f, "isolated"),
            MarginMode::Cross => write!(f, "cross"),
        }
    }
}

/// Position on the leveraged market. `Flat` is the rest state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
}

impl Position {
    pub fn flat(symbol: &str, leverage: u32, margin_mode: MarginMode) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            leverage,
            margin_mode,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size <= f64::EPSILON
    }

    /// Side and size agree with `other` (sizes within `tolerance`)
    pub fn matches(&self, other: &Position, tolerance: f64) -> bool {
        if self.is_flat() && other.is_flat() {
            return true;
        }
        self.side == other.side && (self.size - other.size).abs() <= tolerance
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (mark_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - mark_price) * self.size,
            PositionSide::Flat => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Rejected,
    /// Canceled or expired by the exchange; `filled_size` may be non-zero
    Canceled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Canceled
        )
    }
}

/// Market order submitted to the execution market.
///
/// `client_id` is generated once per logical order and reused on every retry
/// so the exchange can deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, size: f64, reduce_only: bool) -> Self {
        Self {
            client_id: new_client_id(),
            symbol: symbol.to_string(),
            side,
            size,
            reduce_only,
        }
    }
}

/// Exchange-side view of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub client_id: String,
    pub side: OrderSide,
    pub size: f64,
    pub filled_size: f64,
    pub avg_price: Option<f64>,
    pub status: OrderStatus,
}

/// Client order ids must be at most 36 chars on the futures API
pub fn new_client_id() -> String {
    format!("pb-{}", uuid::Uuid::new_v4().simple())
        .chars()
        .take(32)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    OpenLong,
    OpenShort,
    Close,
    Hold,
}

impl SignalKind {
    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalKind::Hold)
    }
}

/// Trade intent derived from one closed candle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeSignal {
    pub kind: SignalKind,
    pub source_candle_time: DateTime<Utc>,
    pub strength: f64,
}

impl TradeSignal {
    pub fn hold(source_candle_time: DateTime<Utc>) -> Self {
        Self {
            kind: SignalKind::Hold,
            source_candle_time,
            strength: 0.0,
        }
    }
}
