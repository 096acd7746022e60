//! Engine event reporting and operator commands
//!
//! Every externally meaningful transition is published exactly once as an
//! [`EngineEvent`] on a broadcast channel and mirrored to the structured
//! log. Operator commands arrive on a separate channel and are consumed by
//! the engine loop.

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::RiskDenial;
use crate::types::{Asset, Direction, Signal};

/// Externally reportable engine transition
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SignalGenerated(Signal),
    SignalDenied {
        asset: Asset,
        reason: RiskDenial,
    },
    PositionOpened {
        asset: Asset,
        direction: Direction,
        qty: f64,
        entry_price: f64,
        stop_price: f64,
    },
    TakeProfitHit {
        asset: Asset,
        level: usize,
        price: f64,
        qty: f64,
    },
    StopLossHit {
        asset: Asset,
        price: f64,
        qty: f64,
    },
    PositionClosed {
        asset: Asset,
        realized_pnl: f64,
    },
    EntryTimedOut {
        asset: Asset,
    },
    RiskHalted {
        reason: RiskDenial,
    },
    ManualReview {
        asset: Asset,
        detail: String,
    },
    DailyReset,
    /// Answer to an operator status request
    Status {
        asset: Asset,
        state: String,
        paused: bool,
        daily_pnl: f64,
        daily_trades: u32,
    },
}

/// Operator command consumed by the engine loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop opening new positions; existing ones keep running
    Pause,
    Resume,
    /// Market-close every open position and cancel pending entries
    CloseAll,
    /// Report per-symbol state and risk counters
    Status,
}

/// Publishes engine events to subscribers and the log
#[derive(Clone)]
pub struct Notifier {
    events: broadcast::Sender<EngineEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::SignalGenerated(s) => {
                info!(asset = %s.asset, direction = %s.direction, confidence = s.confidence,
                    rules = ?s.triggered_by, "signal generated")
            }
            EngineEvent::SignalDenied { asset, reason } => {
                info!(%asset, %reason, "signal denied")
            }
            EngineEvent::PositionOpened { asset, direction, qty, entry_price, stop_price } => {
                info!(%asset, %direction, qty, entry_price, stop_price, "position opened")
            }
            EngineEvent::TakeProfitHit { asset, level, price, qty } => {
                info!(%asset, level = level + 1, price, qty, "take-profit hit")
            }
            EngineEvent::StopLossHit { asset, price, qty } => {
                warn!(%asset, price, qty, "stop-loss hit")
            }
            EngineEvent::PositionClosed { asset, realized_pnl } => {
                info!(%asset, realized_pnl, "position closed")
            }
            EngineEvent::EntryTimedOut { asset } => {
                warn!(%asset, "entry order timed out and was cancelled")
            }
            EngineEvent::RiskHalted { reason } => {
                warn!(%reason, "risk halt latched, no new entries until reset")
            }
            EngineEvent::ManualReview { asset, detail } => {
                warn!(%asset, detail, "symbol placed under manual review")
            }
            EngineEvent::DailyReset => info!("daily risk counters reset"),
            EngineEvent::Status { asset, state, paused, daily_pnl, daily_trades } => {
                info!(%asset, state, paused, daily_pnl, daily_trades, "status")
            }
        }
        // Dropped only when nobody subscribed; the log line above remains
        let _ = self.events.send(event);
    }
}
