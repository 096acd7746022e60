//! Signal Engine - rule composition over indicator state
//!
//! An ordered list of independent rule evaluators each returns an optional
//! (direction, weight) vote; a pure aggregation step combines them:
//! - trend rule: EMA-crossover direction, gated by RSI exhaustion
//! - VWAP-band rule: close beyond an ATR-scaled band votes with the
//!   deviation side
//! - confirmation gate: order-book imbalance must agree in sign and
//!   relative volume must clear the minimum multiplier; failure is a hard
//!   veto, not a down-weight
//! - conflicting long and short votes in one cycle emit nothing
//!
//! Same inputs always yield the same signal: no randomness, no wall clock.

use tracing::debug;
use uuid::Uuid;

use crate::analyzer::Confirmation;
use crate::config::SignalConfig;
use crate::indicators::IndicatorState;
use crate::types::{Asset, Direction, Signal};

/// A single rule's vote
#[derive(Debug, Clone, Copy, PartialEq)]
struct RuleVote {
    name: &'static str,
    direction: Direction,
    weight: f64,
}

pub struct SignalEngine {
    cfg: SignalConfig,
}

impl SignalEngine {
    pub fn new(cfg: SignalConfig) -> Self {
        Self { cfg }
    }

    /// Evaluate one cycle. Returns None when indicators are warming up,
    /// rules disagree, or confirmation vetoes the candidate.
    pub fn evaluate(
        &self,
        asset: Asset,
        state: &IndicatorState,
        confirmation: &Confirmation,
    ) -> Option<Signal> {
        if !state.is_ready() {
            debug!(%asset, "signal skipped: indicators warming up");
            return None;
        }

        let votes: Vec<RuleVote> = [self.trend_rule(state), self.vwap_band_rule(state)]
            .into_iter()
            .flatten()
            .collect();
        if votes.is_empty() {
            return None;
        }

        // Ambiguity defaults to inaction
        let direction = votes[0].direction;
        if votes.iter().any(|v| v.direction != direction) {
            debug!(%asset, "signal suppressed: conflicting long/short votes");
            return None;
        }

        // Hard confirmation veto
        if confirmation.stale {
            debug!(%asset, "signal suppressed: confirmation metrics stale");
            return None;
        }
        if !confirmation.agrees_with(direction.sign(), self.cfg.min_imbalance) {
            debug!(%asset, %direction, imbalance = ?confirmation.imbalance,
                "signal suppressed: order-book imbalance disagrees");
            return None;
        }
        match confirmation.relative_volume {
            Some(rv) if rv >= self.cfg.min_relative_volume => {}
            rv => {
                debug!(%asset, relative_volume = ?rv,
                    "signal suppressed: relative volume below threshold");
                return None;
            }
        }

        let confidence: f64 = votes.iter().map(|v| v.weight).sum::<f64>().clamp(0.0, 1.0);
        let atr = state.atr?;
        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            ts: state.ts,
            asset,
            direction,
            confidence,
            entry_price: state.close,
            atr,
            triggered_by: votes.iter().map(|v| v.name).collect(),
        };
        debug!(%asset, %direction, confidence, rules = ?signal.triggered_by, "signal generated");
        Some(signal)
    }

    /// EMA-crossover direction, vetoed when RSI sits in the exhaustion zone
    /// for that direction (no longs into overbought, no shorts into oversold).
    fn trend_rule(&self, state: &IndicatorState) -> Option<RuleVote> {
        let direction = state.ema_trend()?;
        let rsi = state.rsi?;
        let exhausted = match direction {
            Direction::Long => rsi >= self.cfg.rsi_overbought,
            Direction::Short => rsi <= self.cfg.rsi_oversold,
        };
        if exhausted {
            return None;
        }
        Some(RuleVote {
            name: "ema_trend",
            direction,
            weight: self.cfg.trend_weight,
        })
    }

    /// Close beyond the ATR-scaled VWAP band votes with the deviation side;
    /// entries are only taken on the trade side of VWAP.
    fn vwap_band_rule(&self, state: &IndicatorState) -> Option<RuleVote> {
        let deviation = state.vwap_deviation_atr()?;
        if deviation.abs() < self.cfg.vwap_band_atr {
            return None;
        }
        let direction = if deviation > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        Some(RuleVote {
            name: "vwap_band",
            direction,
            weight: self.cfg.vwap_weight,
        })
    }
}
