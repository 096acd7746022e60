//! Core types used throughout ScalpBot
//!
//! Defines common data structures for candles, order books, signals,
//! orders and fills.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported USDT-margined perpetual contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    BTC,
    ETH,
    SOL,
    XRP,
}

impl Default for Asset {
    fn default() -> Self {
        Asset::BTC
    }
}

impl Asset {
    /// Get the linear contract symbol (e.g., "BTCUSDT")
    pub fn trading_pair(&self) -> &'static str {
        match self {
            Asset::BTC => "BTCUSDT",
            Asset::ETH => "ETHUSDT",
            Asset::SOL => "SOLUSDT",
            Asset::XRP => "XRPUSDT",
        }
    }

    /// Minimum order quantity accepted by the venue, in base units
    pub fn min_order_qty(&self) -> f64 {
        match self {
            Asset::BTC => 0.001,
            Asset::ETH => 0.01,
            Asset::SOL => 1.0,
            Asset::XRP => 10.0,
        }
    }

    /// Minimum stop-loss distance from entry required by the venue (%)
    pub fn min_stop_distance_pct(&self) -> f64 {
        match self {
            Asset::BTC => 0.1,
            Asset::ETH => 0.1,
            Asset::SOL => 0.2,
            Asset::XRP => 0.2,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BTC" | "BTCUSDT" => Some(Asset::BTC),
            "ETH" | "ETHUSDT" => Some(Asset::ETH),
            "SOL" | "SOLUSDT" => Some(Asset::SOL),
            "XRP" | "XRPUSDT" => Some(Asset::XRP),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::BTC => write!(f, "BTC"),
            Asset::ETH => write!(f, "ETH"),
            Asset::SOL => write!(f, "SOL"),
            Asset::XRP => write!(f, "XRP"),
        }
    }
}

/// Trade direction for a signal or position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Opposite direction (used for reduce-only exits)
    pub fn flip(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Closed candlestick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (start of period, milliseconds)
    pub open_time: i64,
    /// Asset
    pub asset: Asset,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

impl Candle {
    /// Typical price used for VWAP accumulation
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Single price level in the order book
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Top-of-book snapshot (top-N levels per side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Timestamp in milliseconds (exchange time)
    pub ts: i64,
    /// Asset
    pub asset: Asset,
    /// Bid levels, best first
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    /// Mid price from the best levels, if both sides are present
    pub fn mid(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }
}

/// Aggressor side of an executed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Executed trade from the venue's public feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    /// Timestamp in milliseconds
    pub ts: i64,
    /// Asset
    pub asset: Asset,
    /// Execution price
    pub price: f64,
    /// Executed quantity in base units
    pub qty: f64,
    /// Taker side
    pub side: TradeSide,
}

/// Market update delivered by the gateway stream
#[derive(Debug, Clone)]
pub enum MarketUpdate {
    Candle(Candle),
    Book(OrderBookSnapshot),
    Trade(TradeTick),
}

impl MarketUpdate {
    pub fn asset(&self) -> Asset {
        match self {
            MarketUpdate::Candle(c) => c.asset,
            MarketUpdate::Book(b) => b.asset,
            MarketUpdate::Trade(t) => t.asset,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            MarketUpdate::Candle(c) => c.open_time,
            MarketUpdate::Book(b) => b.ts,
            MarketUpdate::Trade(t) => t.ts,
        }
    }
}

/// Confirmed entry signal produced by the Signal Engine
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    /// Unique signal ID
    pub id: String,
    /// Timestamp of the evaluation cycle (last candle open time)
    pub ts: i64,
    /// Asset
    pub asset: Asset,
    /// Direction
    pub direction: Direction,
    /// Confidence (0.0 - 1.0), weighted sum of passing rules
    pub confidence: f64,
    /// Reference entry price (last close)
    pub entry_price: f64,
    /// ATR at signal time, used for stop/target placement
    pub atr: f64,
    /// Names of the rules that voted for this signal
    pub triggered_by: Vec<&'static str>,
}

/// Order side at the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in the given direction
    pub fn entry_for(direction: Direction) -> OrderSide {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in the given direction
    pub fn exit_for(direction: Direction) -> OrderSide {
        Self::entry_for(direction.flip())
    }
}

/// Role of an order within a position's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Entry,
    StopLoss,
    /// Take-profit ladder level (0-based index)
    TakeProfit(usize),
    /// Operator-initiated market close of the remaining size
    Close,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Entry => write!(f, "ENTRY"),
            OrderKind::StopLoss => write!(f, "STOP_LOSS"),
            OrderKind::TakeProfit(i) => write!(f, "TAKE_PROFIT_{}", i + 1),
            OrderKind::Close => write!(f, "CLOSE"),
        }
    }
}

/// Venue-assigned order identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order submitted to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-generated correlation ID
    pub client_id: String,
    /// Asset
    pub asset: Asset,
    /// Side
    pub side: OrderSide,
    /// Lifecycle role
    pub kind: OrderKind,
    /// Limit/trigger price; None for market close
    pub price: Option<f64>,
    /// Quantity in base units
    pub qty: f64,
    /// Whether the order may only reduce an existing position
    pub reduce_only: bool,
    /// Maker-only flag; the venue rejects instead of crossing the spread
    pub post_only: bool,
}

/// Fill confirmation reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Venue order ID that filled
    pub order_id: OrderId,
    /// Asset
    pub asset: Asset,
    /// Lifecycle role of the filled order
    pub kind: OrderKind,
    /// Execution price
    pub price: f64,
    /// Filled quantity in base units
    pub qty: f64,
    /// Timestamp in milliseconds
    pub ts: i64,
}

/// Position reported by the venue, used for startup reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub asset: Asset,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
}
