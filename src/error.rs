//! Error taxonomy for the engine
//!
//! Every failure mode carries a tagged variant; retry decisions are made on
//! the variant, never on message text. Computation-layer failures degrade to
//! "no signal this cycle" at the call site and are logged, not propagated.

use crate::types::Asset;
use thiserror::Error;

/// Reason a signal was denied by the Risk Manager
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskDenial {
    #[error("engine halted until {until_ms}")]
    Halted { until_ms: i64 },
    #[error("daily trade cap reached: {count} of {max}")]
    MaxTrades { count: u32, max: u32 },
    #[error("daily loss limit reached: {pnl:.2} <= -{limit:.2}")]
    DailyLoss { pnl: f64, limit: f64 },
    #[error("consecutive loss cap reached: {count} of {max}")]
    ConsecutiveLosses { count: u32, max: u32 },
    #[error("sized quantity {qty} below venue minimum {min_qty}")]
    BelowMinQty { qty: f64, min_qty: f64 },
    #[error("position already open for {asset}")]
    PositionOpen { asset: Asset },
    #[error("symbol under manual review")]
    ManualReview,
    #[error("trading paused by operator")]
    Paused,
}

impl RiskDenial {
    /// Whether the denial latches new entries for the rest of the day
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            RiskDenial::Halted { .. }
                | RiskDenial::DailyLoss { .. }
                | RiskDenial::ConsecutiveLosses { .. }
        )
    }
}

/// Gateway failure, tagged by retryability
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("authentication failure: {0}")]
    Auth(String),
    #[error("order rejected by venue: {0}")]
    Rejected(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl GatewayError {
    /// Transient errors are retried with bounded backoff; terminal errors
    /// fail the attempted action immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::RateLimited { .. }
        )
    }
}

/// Top-level engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stale or malformed market data; the cycle is skipped and logged
    #[error("market data error for {asset}: {detail}")]
    Data { asset: Asset, detail: String },

    /// Bad order parameters; terminal for the triggering signal
    #[error("order validation failed for {asset}: {detail}")]
    Validation { asset: Asset, detail: String },

    /// Network/rate-limit failure exhausted its retry budget
    #[error("gateway failure after {attempts} attempts: {source}")]
    TransientGateway {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// Daily loss/trade cap; halts new entries until reset
    #[error("risk limit: {0}")]
    RiskLimit(#[from] RiskDenial),

    /// Local state disagrees with the venue; symbol enters manual review
    #[error("reconciliation mismatch for {asset}: {detail}")]
    Reconciliation { asset: Asset, detail: String },
}
