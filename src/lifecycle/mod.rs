//! Position lifecycle state machine
//!
//! One manager per contract drives a single position through
//! Idle -> EntryPending -> Open -> PartiallyClosed -> Closed. Entry orders
//! are retried with bounded exponential backoff on transient gateway
//! errors only; a timed-out entry is cancelled and never resubmitted.
//!
//! On entry fill the manager places the protective stop (ATR-scaled,
//! widened to the venue's minimum distance) and the take-profit ladder.
//! Each ladder fill resizes the stop to the remaining quantity and
//! tightens it, first to breakeven and then to the prior take-profit
//! price; the stop never moves away from the market.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::{EngineError, GatewayError, RiskDenial};
use crate::gateway::GatewayAdapter;
use crate::notify::{EngineEvent, Notifier};
use crate::types::{Asset, Direction, Fill, OrderId, OrderKind, OrderRequest, OrderSide, Signal};

/// Entry order resting at the venue, waiting for a fill or timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub order_id: OrderId,
    pub direction: Direction,
    pub qty: f64,
    pub limit_price: f64,
    pub atr: f64,
    pub submitted_ms: i64,
}

/// One rung of the take-profit ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpOrder {
    pub order_id: OrderId,
    pub price: f64,
    pub qty: f64,
    pub filled: bool,
}

/// An open position with its protective orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_price: f64,
    pub atr: f64,
    pub initial_qty: f64,
    pub remaining_qty: f64,
    pub stop_price: f64,
    pub stop_order_id: OrderId,
    pub tp_orders: Vec<TpOrder>,
    /// PnL realized by ladder fills so far
    pub realized_pnl: f64,
    /// Most favorable price seen since entry, drives the trailing stop
    pub extreme_price: f64,
}

impl Position {
    fn unrealized_on(&self, exit_price: f64, qty: f64) -> f64 {
        (exit_price - self.entry_price) * qty * self.direction.sign()
    }

    fn is_partially_closed(&self) -> bool {
        self.tp_orders.iter().any(|tp| tp.filled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionState {
    Idle,
    EntryPending(PendingEntry),
    Open(Position),
    /// At least one ladder level filled, size remains
    PartiallyClosed(Position),
    Closed,
}

impl PositionState {
    /// Whether a new entry may be submitted
    pub fn is_flat(&self) -> bool {
        matches!(self, PositionState::Idle | PositionState::Closed)
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            PositionState::Open(p) | PositionState::PartiallyClosed(p) => Some(p),
            _ => None,
        }
    }

    fn position_mut(&mut self) -> Option<&mut Position> {
        match self {
            PositionState::Open(p) | PositionState::PartiallyClosed(p) => Some(p),
            _ => None,
        }
    }
}

/// Result of applying a fill, for the engine's risk bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Entry filled; counts against the daily trade cap
    EntryFilled,
    /// A ladder level filled but size remains
    PartialClose,
    /// Position fully closed with this realized PnL
    Closed { realized_pnl: f64 },
    /// Fill did not belong to this manager's current trade
    Ignored,
}

pub struct LifecycleManager {
    asset: Asset,
    cfg: LifecycleConfig,
    gateway: Arc<dyn GatewayAdapter>,
    notifier: Notifier,
    state: PositionState,
}

impl LifecycleManager {
    pub fn new(
        asset: Asset,
        cfg: LifecycleConfig,
        gateway: Arc<dyn GatewayAdapter>,
        notifier: Notifier,
    ) -> Self {
        Self {
            asset,
            cfg,
            gateway,
            notifier,
            state: PositionState::Idle,
        }
    }

    pub fn asset(&self) -> Asset {
        self.asset
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    /// Adopt a position restored from a durable snapshot
    pub fn restore(&mut self, position: Position) {
        self.state = if position.is_partially_closed() {
            PositionState::PartiallyClosed(position)
        } else {
            PositionState::Open(position)
        };
    }

    /// Submit a limit entry at the signal's reference price. Transient
    /// gateway errors are retried with exponential backoff up to the
    /// configured budget; exhaustion leaves the manager flat.
    pub async fn submit_entry(
        &mut self,
        signal: &Signal,
        qty: f64,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        if !self.state.is_flat() {
            return Err(EngineError::RiskLimit(RiskDenial::PositionOpen {
                asset: self.asset,
            }));
        }
        let request = OrderRequest {
            client_id: Uuid::new_v4().to_string(),
            asset: self.asset,
            side: OrderSide::entry_for(signal.direction),
            kind: OrderKind::Entry,
            price: Some(signal.entry_price),
            qty,
            reduce_only: false,
            post_only: true,
        };
        let order_id = self.place_with_retry(&request).await?;
        self.state = PositionState::EntryPending(PendingEntry {
            order_id,
            direction: signal.direction,
            qty,
            limit_price: signal.entry_price,
            atr: signal.atr,
            submitted_ms: now_ms,
        });
        Ok(())
    }

    /// Apply a fill reported by the gateway
    pub async fn on_fill(&mut self, fill: &Fill, _now_ms: i64) -> Result<FillOutcome, EngineError> {
        if fill.asset != self.asset {
            return Ok(FillOutcome::Ignored);
        }
        match fill.kind {
            OrderKind::Entry => {
                let PositionState::EntryPending(pending) = &self.state else {
                    return Ok(self.unmatched(fill));
                };
                if pending.order_id != fill.order_id {
                    return Ok(self.unmatched(fill));
                }
                let pending = pending.clone();
                self.open_position(&pending, fill).await?;
                Ok(FillOutcome::EntryFilled)
            }
            OrderKind::TakeProfit(level) => self.on_take_profit(level, fill).await,
            OrderKind::StopLoss => self.on_stop_loss(fill).await,
            OrderKind::Close => self.on_market_close(fill),
        }
    }

    fn unmatched(&self, fill: &Fill) -> FillOutcome {
        warn!(asset = %self.asset, kind = %fill.kind, order_id = %fill.order_id,
            "fill does not match the current lifecycle state");
        FillOutcome::Ignored
    }

    /// Entry filled: place the protective stop and the take-profit ladder
    async fn open_position(&mut self, pending: &PendingEntry, fill: &Fill) -> Result<(), EngineError> {
        let direction = pending.direction;
        let entry = fill.price;
        let sign = direction.sign();

        // ATR stop, widened to the venue's minimum distance from entry
        let min_distance = entry * self.asset.min_stop_distance_pct() / 100.0;
        let distance = (pending.atr * self.cfg.stop_atr_mult).max(min_distance);
        let stop_price = entry - sign * distance;

        let stop_request = OrderRequest {
            client_id: Uuid::new_v4().to_string(),
            asset: self.asset,
            side: OrderSide::exit_for(direction),
            kind: OrderKind::StopLoss,
            price: Some(stop_price),
            qty: fill.qty,
            reduce_only: true,
            post_only: false,
        };
        let stop_order_id = self.place_with_retry(&stop_request).await?;

        // Ladder quantities: configured fractions, remainder on the last rung
        let mut tp_orders = Vec::with_capacity(self.cfg.tp_levels.len());
        let mut allocated = 0.0;
        let last = self.cfg.tp_levels.len() - 1;
        for (i, level) in self.cfg.tp_levels.iter().enumerate() {
            let qty = if i == last {
                fill.qty - allocated
            } else {
                fill.qty * level.fraction
            };
            allocated += qty;
            let price = entry + sign * pending.atr * level.atr_mult;
            let request = OrderRequest {
                client_id: Uuid::new_v4().to_string(),
                asset: self.asset,
                side: OrderSide::exit_for(direction),
                kind: OrderKind::TakeProfit(i),
                price: Some(price),
                qty,
                reduce_only: true,
                post_only: false,
            };
            let order_id = self.place_with_retry(&request).await?;
            tp_orders.push(TpOrder {
                order_id,
                price,
                qty,
                filled: false,
            });
        }

        self.state = PositionState::Open(Position {
            direction,
            entry_price: entry,
            atr: pending.atr,
            initial_qty: fill.qty,
            remaining_qty: fill.qty,
            stop_price,
            stop_order_id,
            tp_orders,
            realized_pnl: 0.0,
            extreme_price: entry,
        });
        self.notifier.publish(EngineEvent::PositionOpened {
            asset: self.asset,
            direction,
            qty: fill.qty,
            entry_price: entry,
            stop_price,
        });
        Ok(())
    }

    async fn on_take_profit(&mut self, level: usize, fill: &Fill) -> Result<FillOutcome, EngineError> {
        let Some(position) = self.state.position_mut() else {
            return Ok(FillOutcome::Ignored);
        };
        let Some(tp) = position.tp_orders.get_mut(level) else {
            return Ok(FillOutcome::Ignored);
        };
        if tp.filled || tp.order_id != fill.order_id {
            return Ok(FillOutcome::Ignored);
        }
        tp.filled = true;
        position.remaining_qty -= fill.qty;
        position.realized_pnl += position.unrealized_on(fill.price, fill.qty);
        self.notifier.publish(EngineEvent::TakeProfitHit {
            asset: self.asset,
            level,
            price: fill.price,
            qty: fill.qty,
        });

        if position.remaining_qty <= f64::EPSILON {
            // Final rung: nothing left to protect
            let realized = position.realized_pnl;
            let stop_id = position.stop_order_id.clone();
            self.cancel_quietly(&stop_id).await;
            self.finish(realized);
            return Ok(FillOutcome::Closed { realized_pnl: realized });
        }

        // Resize the stop to the remainder and tighten it: breakeven after
        // the first rung, the prior rung's price after. The price never
        // moves away from the market.
        let candidate = if level == 0 {
            position.entry_price
        } else {
            position.tp_orders[level - 1].price
        };
        let sign = position.direction.sign();
        let new_stop = if (candidate - position.stop_price) * sign > 0.0 {
            candidate
        } else {
            position.stop_price
        };
        let remaining = position.remaining_qty;
        let stop_id = position.stop_order_id.clone();
        match self.amend_with_retry(&stop_id, new_stop, remaining).await {
            Ok(()) => {
                if let Some(p) = self.state.position_mut() {
                    p.stop_price = new_stop;
                }
            }
            Err(err) => {
                // Old stop still protects the position; a stale-sized fill
                // is clamped when it arrives
                warn!(asset = %self.asset, %err, "stop resize failed, keeping prior stop");
            }
        }
        self.mark_partially_closed();
        Ok(FillOutcome::PartialClose)
    }

    fn mark_partially_closed(&mut self) {
        if matches!(self.state, PositionState::Open(_)) {
            if let PositionState::Open(p) = std::mem::replace(&mut self.state, PositionState::Idle)
            {
                self.state = PositionState::PartiallyClosed(p);
            }
        }
    }

    async fn on_stop_loss(&mut self, fill: &Fill) -> Result<FillOutcome, EngineError> {
        let Some(position) = self.state.position_mut() else {
            return Ok(FillOutcome::Ignored);
        };
        if position.stop_order_id != fill.order_id {
            return Ok(FillOutcome::Ignored);
        }
        // A stop whose resize never landed still reports the pre-partial
        // size; only the remainder is booked
        let qty = fill.qty.min(position.remaining_qty);
        let realized = position.realized_pnl + position.unrealized_on(fill.price, qty);
        let open_tps: Vec<OrderId> = position
            .tp_orders
            .iter()
            .filter(|tp| !tp.filled)
            .map(|tp| tp.order_id.clone())
            .collect();
        self.notifier.publish(EngineEvent::StopLossHit {
            asset: self.asset,
            price: fill.price,
            qty,
        });
        for order_id in &open_tps {
            self.cancel_quietly(order_id).await;
        }
        self.finish(realized);
        Ok(FillOutcome::Closed { realized_pnl: realized })
    }

    fn on_market_close(&mut self, fill: &Fill) -> Result<FillOutcome, EngineError> {
        let Some(position) = self.state.position_mut() else {
            return Ok(FillOutcome::Ignored);
        };
        let qty = fill.qty.min(position.remaining_qty);
        let realized = position.realized_pnl + position.unrealized_on(fill.price, qty);
        self.finish(realized);
        Ok(FillOutcome::Closed { realized_pnl: realized })
    }

    fn finish(&mut self, realized_pnl: f64) {
        self.state = PositionState::Closed;
        self.notifier.publish(EngineEvent::PositionClosed {
            asset: self.asset,
            realized_pnl,
        });
    }

    /// Periodic maintenance: cancel a timed-out entry. A cancelled entry is
    /// reported once and never resubmitted.
    pub async fn sweep(&mut self, now_ms: i64) -> Result<(), EngineError> {
        let PositionState::EntryPending(pending) = &self.state else {
            return Ok(());
        };
        if now_ms - pending.submitted_ms < self.cfg.entry_timeout_ms {
            return Ok(());
        }
        let order_id = pending.order_id.clone();
        match self.gateway.cancel_order(self.asset, &order_id).await {
            Ok(()) | Err(GatewayError::UnknownOrder(_)) => {}
            Err(err) => {
                warn!(asset = %self.asset, %err, "entry cancel failed, will retry next sweep");
                return Ok(());
            }
        }
        self.state = PositionState::Idle;
        self.notifier.publish(EngineEvent::EntryTimedOut { asset: self.asset });
        Ok(())
    }

    /// Track the favorable extreme and trail the stop behind it. The stop
    /// only ever tightens, and only when the improvement clears the venue's
    /// minimum amend step.
    pub async fn on_price(&mut self, price: f64) {
        let Some(position) = self.state.position_mut() else {
            return;
        };
        let sign = position.direction.sign();
        if (price - position.extreme_price) * sign > 0.0 {
            position.extreme_price = price;
        }
        let candidate = position.extreme_price * (1.0 - sign * self.cfg.trailing_stop_pct / 100.0);
        let improvement = (candidate - position.stop_price) * sign;
        if improvement <= 0.0 {
            return;
        }
        if improvement < position.stop_price.abs() * self.cfg.trail_min_step_pct / 100.0 {
            debug!(asset = %self.asset, candidate, "trail step below venue minimum, skipping amend");
            return;
        }
        let stop_id = position.stop_order_id.clone();
        let qty = position.remaining_qty;
        match self.amend_with_retry(&stop_id, candidate, qty).await {
            Ok(()) => {
                if let Some(p) = self.state.position_mut() {
                    p.stop_price = candidate;
                }
            }
            Err(err) => {
                warn!(asset = %self.asset, %err, "trailing amend failed, keeping prior stop");
            }
        }
    }

    /// Operator close: cancel pending/protective orders and market-close the
    /// remaining size. The realized PnL arrives with the close fill.
    pub async fn close_all(&mut self) -> Result<(), EngineError> {
        match &self.state {
            PositionState::EntryPending(pending) => {
                let order_id = pending.order_id.clone();
                self.cancel_quietly(&order_id).await;
                self.state = PositionState::Idle;
                debug!(asset = %self.asset, "pending entry cancelled by operator");
                Ok(())
            }
            PositionState::Open(position) | PositionState::PartiallyClosed(position) => {
                let stop_id = position.stop_order_id.clone();
                let open_tps: Vec<OrderId> = position
                    .tp_orders
                    .iter()
                    .filter(|tp| !tp.filled)
                    .map(|tp| tp.order_id.clone())
                    .collect();
                let request = OrderRequest {
                    client_id: Uuid::new_v4().to_string(),
                    asset: self.asset,
                    side: OrderSide::exit_for(position.direction),
                    kind: OrderKind::Close,
                    price: None,
                    qty: position.remaining_qty,
                    reduce_only: true,
                    post_only: false,
                };
                self.cancel_quietly(&stop_id).await;
                for order_id in &open_tps {
                    self.cancel_quietly(order_id).await;
                }
                self.place_with_retry(&request).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn cancel_quietly(&self, order_id: &OrderId) {
        match self.gateway.cancel_order(self.asset, order_id).await {
            Ok(()) | Err(GatewayError::UnknownOrder(_)) => {}
            Err(err) => warn!(asset = %self.asset, %order_id, %err, "order cancel failed"),
        }
    }

    async fn place_with_retry(&self, request: &OrderRequest) -> Result<OrderId, EngineError> {
        let gateway = self.gateway.clone();
        retry(&self.cfg, self.asset, || {
            let gateway = gateway.clone();
            let request = request.clone();
            async move { gateway.place_order(&request).await }
        })
        .await
    }

    async fn amend_with_retry(
        &self,
        order_id: &OrderId,
        price: f64,
        qty: f64,
    ) -> Result<(), EngineError> {
        let gateway = self.gateway.clone();
        let asset = self.asset;
        retry(&self.cfg, asset, || {
            let gateway = gateway.clone();
            let order_id = order_id.clone();
            async move { gateway.amend_stop(asset, &order_id, price, qty).await }
        })
        .await
    }
}

/// Bounded exponential backoff, transient errors only. Terminal gateway
/// errors fail the action on the first attempt.
async fn retry<T, F, Fut>(cfg: &LifecycleConfig, asset: Asset, mut call: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < cfg.max_retries => {
                let delay = cfg.retry_backoff_ms << attempt;
                debug!(%asset, %err, attempt, delay_ms = delay, "transient gateway error, backing off");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) if err.is_transient() => {
                return Err(EngineError::TransientGateway {
                    attempts: attempt + 1,
                    source: err,
                });
            }
            Err(err) => {
                return Err(EngineError::Validation {
                    asset,
                    detail: err.to_string(),
                });
            }
        }
    }
}
