//! Order-Book & Volume Analyzer - confirmation metrics
//!
//! Maintains a rolling view of the order book, recent aggressor flow and
//! per-candle volume, and derives confirmation metrics on read:
//! - imbalance ratio = (bid - ask) / (bid + ask) over the top-N levels
//! - relative volume = last candle volume / trailing average
//! - aggressor flow ratio from executed trades over a sliding time window
//!
//! Samples older than `max_age_ms` are excluded and the metrics flagged
//! stale instead of being computed from expired data.

use std::collections::VecDeque;

use crate::config::AnalyzerConfig;
use crate::types::{Candle, OrderBookSnapshot, TradeSide, TradeTick};

/// Confirmation metrics derived on read; `None` fields are not yet warmed up
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confirmation {
    /// Order-book imbalance over the top-N levels, in [-1, 1]
    pub imbalance: Option<f64>,
    /// Last closed-candle volume relative to the trailing average
    pub relative_volume: Option<f64>,
    /// Aggressor flow: (buy - sell) / (buy + sell) executed volume, in [-1, 1]
    pub flow_ratio: Option<f64>,
    /// Book or trade data exceeded its max age; metrics must not be used
    pub stale: bool,
}

impl Confirmation {
    /// Whether the metrics agree with a candidate direction sign
    /// (+1 long, -1 short) at the given imbalance threshold.
    pub fn agrees_with(&self, sign: f64, min_imbalance: f64) -> bool {
        match self.imbalance {
            Some(imb) => imb * sign >= min_imbalance,
            None => false,
        }
    }
}

/// Rolling analyzer for one asset
#[derive(Debug)]
pub struct MarketAnalyzer {
    cfg: AnalyzerConfig,
    /// Latest book snapshot and its receive time
    book: Option<OrderBookSnapshot>,
    /// Recent executed trades inside the sliding window, oldest first
    trades: VecDeque<TradeTick>,
    /// Closed-candle volumes, newest last; bounded by volume_lookback + 1
    volumes: VecDeque<f64>,
    /// Timestamp of the most recent market update of any kind
    last_update_ts: i64,
}

impl MarketAnalyzer {
    pub fn new(cfg: AnalyzerConfig) -> Self {
        Self {
            book: None,
            trades: VecDeque::new(),
            volumes: VecDeque::new(),
            last_update_ts: 0,
            cfg,
        }
    }

    pub fn on_book(&mut self, snapshot: OrderBookSnapshot) {
        self.last_update_ts = self.last_update_ts.max(snapshot.ts);
        self.book = Some(snapshot);
    }

    pub fn on_trade(&mut self, tick: TradeTick) {
        self.last_update_ts = self.last_update_ts.max(tick.ts);
        self.trades.push_back(tick);
        self.evict_trades();
    }

    pub fn on_closed_candle(&mut self, candle: &Candle) {
        self.last_update_ts = self.last_update_ts.max(candle.open_time);
        if self.volumes.len() > self.cfg.volume_lookback {
            self.volumes.pop_front();
        }
        self.volumes.push_back(candle.volume);
    }

    fn evict_trades(&mut self) {
        let cutoff = self.last_update_ts - self.cfg.trade_window_ms;
        while let Some(front) = self.trades.front() {
            if front.ts < cutoff {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// Milliseconds since the last successful market update
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_update_ts
    }

    /// Derive confirmation metrics as of `now_ms`
    pub fn confirmation(&self, now_ms: i64) -> Confirmation {
        if self.last_update_ts == 0 || self.age_ms(now_ms) > self.cfg.max_age_ms {
            return Confirmation {
                stale: true,
                ..Confirmation::default()
            };
        }

        let imbalance = self.book.as_ref().and_then(|book| {
            if now_ms - book.ts > self.cfg.max_age_ms {
                return None;
            }
            let bid: f64 = book.bids.iter().take(self.cfg.book_depth).map(|l| l.size).sum();
            let ask: f64 = book.asks.iter().take(self.cfg.book_depth).map(|l| l.size).sum();
            let total = bid + ask;
            if total > 0.0 {
                Some((bid - ask) / total)
            } else {
                None
            }
        });

        let relative_volume = if self.volumes.len() >= 2 {
            let current = *self.volumes.back().unwrap_or(&0.0);
            let prior = self.volumes.len() - 1;
            let avg: f64 = self.volumes.iter().take(prior).sum::<f64>() / prior as f64;
            if avg > 0.0 {
                Some(current / avg)
            } else {
                None
            }
        } else {
            None
        };

        let flow_ratio = {
            let cutoff = now_ms - self.cfg.trade_window_ms;
            let mut buy = 0.0;
            let mut sell = 0.0;
            for t in self.trades.iter().filter(|t| t.ts >= cutoff) {
                match t.side {
                    TradeSide::Buy => buy += t.qty,
                    TradeSide::Sell => sell += t.qty,
                }
            }
            let total = buy + sell;
            if total > 0.0 {
                Some((buy - sell) / total)
            } else {
                None
            }
        };

        Confirmation {
            imbalance,
            relative_volume,
            flow_ratio,
            stale: false,
        }
    }
}
