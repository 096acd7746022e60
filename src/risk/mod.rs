//! Risk management and position sizing
//!
//! Single authority over daily exposure. Every candidate entry passes
//! through [`RiskManager::authorize`], which checks the halt latch, the
//! daily trade cap, the realized-loss limit and the consecutive-loss cap
//! in that order, then sizes the position so a stop-out loses a fixed
//! currency amount.
//!
//! Counters roll at a configurable UTC hour. A halt is one-way: once
//! latched it holds until the next reset boundary, even if later wins
//! bring the day back above the loss limit.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::error::RiskDenial;
use crate::types::Asset;

const DAY_MS: i64 = 86_400_000;
const HOUR_MS: i64 = 3_600_000;

/// Durable risk counters for the current trading day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskState {
    /// Realized PnL since the last reset (USDT)
    pub daily_realized_pnl: f64,
    /// Entries filled since the last reset
    pub daily_trade_count: u32,
    /// Losing trades in a row; any win resets it
    pub consecutive_losses: u32,
    /// Start of the current risk day (ms since epoch)
    pub period_start_ms: i64,
    /// Entry halt latch; holds until the next reset boundary
    pub halted_until_ms: Option<i64>,
}

impl RiskState {
    fn fresh(period_start_ms: i64) -> Self {
        Self {
            daily_realized_pnl: 0.0,
            daily_trade_count: 0,
            consecutive_losses: 0,
            period_start_ms,
            halted_until_ms: None,
        }
    }
}

pub struct RiskManager {
    cfg: RiskConfig,
    state: RwLock<RiskState>,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig, now_ms: i64) -> Self {
        let start = period_start(now_ms, cfg.reset_hour_utc);
        Self {
            state: RwLock::new(RiskState::fresh(start)),
            cfg,
        }
    }

    /// Restore counters from a persisted snapshot. A stale snapshot from a
    /// previous risk day is discarded; a halt latch is only honored when
    /// `persist_halt` is set.
    pub fn restore(cfg: RiskConfig, mut snapshot: RiskState, now_ms: i64) -> Self {
        let start = period_start(now_ms, cfg.reset_hour_utc);
        if snapshot.period_start_ms != start {
            info!(
                snapshot_period = snapshot.period_start_ms,
                current_period = start,
                "risk snapshot from a previous day, starting fresh"
            );
            snapshot = RiskState::fresh(start);
        } else if !cfg.persist_halt && snapshot.halted_until_ms.is_some() {
            warn!("discarding persisted halt latch per configuration");
            snapshot.halted_until_ms = None;
        }
        Self {
            state: RwLock::new(snapshot),
            cfg,
        }
    }

    /// Roll the counters if `now_ms` has crossed the reset boundary.
    /// Returns true when a reset happened so the caller can report it.
    pub async fn maybe_roll(&self, now_ms: i64) -> bool {
        let mut state = self.state.write().await;
        self.roll_locked(&mut state, now_ms)
    }

    fn roll_locked(&self, state: &mut RiskState, now_ms: i64) -> bool {
        let start = period_start(now_ms, self.cfg.reset_hour_utc);
        if start > state.period_start_ms {
            info!(
                pnl = state.daily_realized_pnl,
                trades = state.daily_trade_count,
                "daily risk counters reset"
            );
            *state = RiskState::fresh(start);
            true
        } else {
            false
        }
    }

    /// Authorize an entry and return the sized quantity in base units.
    ///
    /// `stop_distance` is the price distance from entry to the initial stop;
    /// the size is chosen so a stop-out realizes `risk_per_trade`, then
    /// capped by the absolute quantity limit and by available margin.
    pub async fn authorize(
        &self,
        asset: Asset,
        entry_price: f64,
        stop_distance: f64,
        margin_available: f64,
        now_ms: i64,
    ) -> Result<f64, RiskDenial> {
        let mut state = self.state.write().await;
        self.roll_locked(&mut state, now_ms);

        if let Some(until) = state.halted_until_ms {
            return Err(RiskDenial::Halted { until_ms: until });
        }
        if state.daily_trade_count >= self.cfg.max_trades_per_day {
            return Err(RiskDenial::MaxTrades {
                count: state.daily_trade_count,
                max: self.cfg.max_trades_per_day,
            });
        }
        if state.daily_realized_pnl <= -self.cfg.max_daily_loss {
            let until = self.latch_halt(&mut state, now_ms);
            warn!(pnl = state.daily_realized_pnl, until_ms = until, "daily loss limit reached");
            return Err(RiskDenial::DailyLoss {
                pnl: state.daily_realized_pnl,
                limit: self.cfg.max_daily_loss,
            });
        }
        if state.consecutive_losses >= self.cfg.max_consecutive_losses {
            let until = self.latch_halt(&mut state, now_ms);
            warn!(losses = state.consecutive_losses, until_ms = until, "consecutive loss cap reached");
            return Err(RiskDenial::ConsecutiveLosses {
                count: state.consecutive_losses,
                max: self.cfg.max_consecutive_losses,
            });
        }

        if stop_distance <= 0.0 || entry_price <= 0.0 {
            return Err(RiskDenial::BelowMinQty {
                qty: 0.0,
                min_qty: asset.min_order_qty(),
            });
        }
        let risk_qty = self.cfg.risk_per_trade / stop_distance;
        let margin_qty = margin_available * self.cfg.leverage as f64 / entry_price;
        let qty = risk_qty.min(self.cfg.max_position_qty).min(margin_qty);
        if qty < asset.min_order_qty() {
            return Err(RiskDenial::BelowMinQty {
                qty,
                min_qty: asset.min_order_qty(),
            });
        }
        Ok(qty)
    }

    /// Count an entry fill against the daily trade cap
    pub async fn record_entry_fill(&self, now_ms: i64) {
        let mut state = self.state.write().await;
        self.roll_locked(&mut state, now_ms);
        state.daily_trade_count += 1;
        info!(trades = state.daily_trade_count, "entry counted against daily cap");
    }

    /// Record realized PnL from a closed position. Returns the halt denial
    /// if this close tripped a limit, so it can be reported exactly once.
    pub async fn record_realized_pnl(&self, pnl: f64, now_ms: i64) -> Option<RiskDenial> {
        let mut state = self.state.write().await;
        self.roll_locked(&mut state, now_ms);
        state.daily_realized_pnl += pnl;
        if pnl < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        info!(
            pnl,
            daily = state.daily_realized_pnl,
            losses = state.consecutive_losses,
            "realized pnl recorded"
        );

        if state.halted_until_ms.is_some() {
            return None;
        }
        if state.daily_realized_pnl <= -self.cfg.max_daily_loss {
            let until = self.latch_halt(&mut state, now_ms);
            warn!(daily = state.daily_realized_pnl, until_ms = until, "daily loss limit reached, halting entries");
            return Some(RiskDenial::DailyLoss {
                pnl: state.daily_realized_pnl,
                limit: self.cfg.max_daily_loss,
            });
        }
        if state.consecutive_losses >= self.cfg.max_consecutive_losses {
            let until = self.latch_halt(&mut state, now_ms);
            warn!(losses = state.consecutive_losses, until_ms = until, "consecutive loss cap reached, halting entries");
            return Some(RiskDenial::ConsecutiveLosses {
                count: state.consecutive_losses,
                max: self.cfg.max_consecutive_losses,
            });
        }
        None
    }

    fn latch_halt(&self, state: &mut RiskState, now_ms: i64) -> i64 {
        let until = period_start(now_ms, self.cfg.reset_hour_utc) + DAY_MS;
        state.halted_until_ms = Some(until);
        until
    }

    pub async fn is_halted(&self, now_ms: i64) -> bool {
        let mut state = self.state.write().await;
        self.roll_locked(&mut state, now_ms);
        state.halted_until_ms.is_some()
    }

    /// Snapshot for durable persistence
    pub async fn snapshot(&self) -> RiskState {
        self.state.read().await.clone()
    }
}

/// Start of the risk day containing `now_ms`, anchored at `reset_hour` UTC
fn period_start(now_ms: i64, reset_hour: u32) -> i64 {
    let offset = reset_hour as i64 * HOUR_MS;
    (now_ms - offset).div_euclid(DAY_MS) * DAY_MS + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> RiskConfig {
        RiskConfig {
            risk_per_trade: 10.0,
            max_position_qty: 0.05,
            max_trades_per_day: 3,
            max_daily_loss: 100.0,
            max_consecutive_losses: 3,
            leverage: 3,
            min_leverage: 1,
            max_leverage: 5,
            reset_hour_utc: 0,
            persist_halt: true,
        }
    }

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_sizing_from_risk_per_trade() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        // 10 USDT at risk over a 500 USDT stop distance = 0.02 BTC
        let qty = mgr
            .authorize(Asset::BTC, 50_000.0, 500.0, 10_000.0, NOW)
            .await
            .unwrap();
        assert!((qty - 0.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_sizing_capped_by_max_qty_and_margin() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        // A tight stop would size 0.1 BTC; the absolute cap wins
        let qty = mgr
            .authorize(Asset::BTC, 50_000.0, 100.0, 10_000.0, NOW)
            .await
            .unwrap();
        assert!((qty - 0.05).abs() < 1e-12);

        // Thin margin caps below the risk size: 100 * 3 / 50_000 = 0.006
        let qty = mgr
            .authorize(Asset::BTC, 50_000.0, 500.0, 100.0, NOW)
            .await
            .unwrap();
        assert!((qty - 0.006).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_below_venue_minimum_denied() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        // Wide stop sizes 0.0002 BTC, under the 0.001 venue minimum
        let err = mgr
            .authorize(Asset::BTC, 50_000.0, 50_000.0, 10_000.0, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskDenial::BelowMinQty { .. }));
    }

    #[tokio::test]
    async fn test_daily_loss_latches_until_reset() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        let halt = mgr.record_realized_pnl(-120.0, NOW).await;
        assert!(matches!(halt, Some(RiskDenial::DailyLoss { .. })));

        // Latched: further entries denied even after a win recovers the pnl
        mgr.record_realized_pnl(50.0, NOW).await;
        let err = mgr
            .authorize(Asset::BTC, 50_000.0, 500.0, 10_000.0, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskDenial::Halted { .. }));

        // Next day the latch clears
        let tomorrow = NOW + DAY_MS;
        assert!(mgr.maybe_roll(tomorrow).await);
        assert!(mgr
            .authorize(Asset::BTC, 50_000.0, 500.0, 10_000.0, tomorrow)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_trade_cap_denies_without_halting() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        for _ in 0..3 {
            mgr.record_entry_fill(NOW).await;
        }
        let err = mgr
            .authorize(Asset::BTC, 50_000.0, 500.0, 10_000.0, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskDenial::MaxTrades { count: 3, max: 3 }));
        assert!(!err.is_halt());
    }

    #[tokio::test]
    async fn test_consecutive_losses_halt() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        assert!(mgr.record_realized_pnl(-5.0, NOW).await.is_none());
        assert!(mgr.record_realized_pnl(-5.0, NOW).await.is_none());
        let halt = mgr.record_realized_pnl(-5.0, NOW).await;
        assert!(matches!(halt, Some(RiskDenial::ConsecutiveLosses { count: 3, max: 3 })));
        assert!(mgr.is_halted(NOW).await);
    }

    #[tokio::test]
    async fn test_win_resets_loss_streak() {
        let mgr = RiskManager::new(test_cfg(), NOW);
        mgr.record_realized_pnl(-5.0, NOW).await;
        mgr.record_realized_pnl(-5.0, NOW).await;
        mgr.record_realized_pnl(3.0, NOW).await;
        assert_eq!(mgr.snapshot().await.consecutive_losses, 0);
        assert!(!mgr.is_halted(NOW).await);
    }

    #[tokio::test]
    async fn test_reset_hour_shifts_boundary() {
        let mut cfg = test_cfg();
        cfg.reset_hour_utc = 8;
        // 1_700_000_000_000 ms = 2023-11-14 22:13:20 UTC; the 08:00 boundary
        // already passed, so midnight does not roll the counters
        let mgr = RiskManager::new(cfg, NOW);
        mgr.record_entry_fill(NOW).await;
        let midnight_next = (NOW.div_euclid(DAY_MS) + 1) * DAY_MS;
        assert!(!mgr.maybe_roll(midnight_next).await);
        assert_eq!(mgr.snapshot().await.daily_trade_count, 1);
        // 08:00 the next day rolls
        assert!(mgr.maybe_roll(midnight_next + 8 * HOUR_MS).await);
        assert_eq!(mgr.snapshot().await.daily_trade_count, 0);
    }

    #[tokio::test]
    async fn test_restore_honors_persist_halt_flag() {
        let snapshot = RiskState {
            daily_realized_pnl: -120.0,
            daily_trade_count: 5,
            consecutive_losses: 2,
            period_start_ms: period_start(NOW, 0),
            halted_until_ms: Some(period_start(NOW, 0) + DAY_MS),
        };

        let mgr = RiskManager::restore(test_cfg(), snapshot.clone(), NOW);
        assert!(mgr.is_halted(NOW).await);

        let mut cfg = test_cfg();
        cfg.persist_halt = false;
        let mgr = RiskManager::restore(cfg, snapshot.clone(), NOW);
        assert!(!mgr.is_halted(NOW).await);
        // Counters survive either way
        assert_eq!(mgr.snapshot().await.daily_trade_count, 5);

        // A snapshot from yesterday is discarded wholesale
        let mut old = snapshot;
        old.period_start_ms -= DAY_MS;
        let mgr = RiskManager::restore(test_cfg(), old, NOW);
        assert_eq!(mgr.snapshot().await.daily_trade_count, 0);
        assert!(!mgr.is_halted(NOW).await);
    }
}
