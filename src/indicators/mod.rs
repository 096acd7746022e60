//! Indicator Pipeline - streaming technical indicators
//!
//! Computes SMA, EMA (fast/slow), ATR, RSI and VWAP incrementally from the
//! closed-candle stream:
//! - EMA uses smoothing 2/(N+1), seeded by the first SMA of N candles
//! - ATR and RSI use Wilder's smoothing
//! - VWAP accumulates typical price x volume, reset at the session boundary
//!   or computed over a rolling candle window
//!
//! Indicators with fewer than N candles of history stay `None` ("warming
//! up"); consumers gate on `IndicatorState::is_ready()` instead of reading
//! numeric defaults. Updates are a pure function of candle-stream order.

use std::collections::VecDeque;

use crate::config::{IndicatorConfig, VwapReset};
use crate::error::EngineError;
use crate::types::{Asset, Candle, Direction};

/// How many EMA-spread values are kept for crossover checks
const SPREAD_HISTORY: usize = 3;

/// Per-asset indicator snapshot, updated exactly once per closed candle
#[derive(Debug, Clone, Default)]
pub struct IndicatorState {
    /// Open time of the candle this state was computed from
    pub ts: i64,
    /// Close of that candle
    pub close: f64,
    pub sma: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub atr: Option<f64>,
    pub rsi: Option<f64>,
    pub vwap: Option<f64>,
    /// Last few values of (ema_fast - ema_slow), newest last
    pub ema_spread_history: VecDeque<f64>,
}

impl IndicatorState {
    /// All indicators warmed up and usable
    pub fn is_ready(&self) -> bool {
        self.sma.is_some()
            && self.ema_fast.is_some()
            && self.ema_slow.is_some()
            && self.atr.is_some()
            && self.rsi.is_some()
            && self.vwap.is_some()
    }

    /// Direction of the EMA crossover, filtered against whipsaw: the latest
    /// spread sign must be shared by the majority of the recent history.
    pub fn ema_trend(&self) -> Option<Direction> {
        let latest = *self.ema_spread_history.back()?;
        if latest == 0.0 {
            return None;
        }
        let agreeing = self
            .ema_spread_history
            .iter()
            .filter(|s| s.signum() == latest.signum())
            .count();
        if agreeing * 2 <= self.ema_spread_history.len() {
            return None;
        }
        Some(if latest > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        })
    }

    /// Signed distance of close from VWAP in ATR units
    pub fn vwap_deviation_atr(&self) -> Option<f64> {
        let vwap = self.vwap?;
        let atr = self.atr?;
        if atr <= 0.0 {
            return None;
        }
        Some((self.close - vwap) / atr)
    }
}

/// EMA seeded by the first SMA of N closes, incremental afterwards
#[derive(Debug, Clone)]
struct Ema {
    period: usize,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self {
            period,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        match self.value {
            None => {
                self.seed_sum += close;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
            Some(prev) => {
                let k = 2.0 / (self.period as f64 + 1.0);
                self.value = Some((close - prev) * k + prev);
            }
        }
        self.value
    }
}

/// ATR with Wilder's smoothing, seeded by the mean of the first N true ranges
#[derive(Debug, Clone)]
struct Atr {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl Atr {
    fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    fn update(&mut self, candle: &Candle) -> Option<f64> {
        if let Some(prev_close) = self.prev_close {
            let tr = (candle.high - candle.low)
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs());
            match self.value {
                None => {
                    self.seed_sum += tr;
                    self.seed_count += 1;
                    if self.seed_count == self.period {
                        self.value = Some(self.seed_sum / self.period as f64);
                    }
                }
                Some(prev) => {
                    self.value = Some(prev + (tr - prev) / self.period as f64);
                }
            }
        }
        self.prev_close = Some(candle.close);
        self.value
    }
}

/// RSI with Wilder's smoothed average gain/loss
#[derive(Debug, Clone)]
struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    seed_gain: f64,
    seed_loss: f64,
    seed_count: usize,
    /// (avg_gain, avg_loss) once seeded
    state: Option<(f64, f64)>,
}

impl Rsi {
    fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_gain: 0.0,
            seed_loss: 0.0,
            seed_count: 0,
            state: None,
        }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        let prev_close = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return None,
        };
        let change = close - prev_close;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        let (avg_gain, avg_loss) = match self.state {
            None => {
                self.seed_gain += gain;
                self.seed_loss += loss;
                self.seed_count += 1;
                if self.seed_count < self.period {
                    return None;
                }
                (
                    self.seed_gain / self.period as f64,
                    self.seed_loss / self.period as f64,
                )
            }
            Some((prev_gain, prev_loss)) => {
                let n = self.period as f64;
                (
                    (prev_gain * (n - 1.0) + gain) / n,
                    (prev_loss * (n - 1.0) + loss) / n,
                )
            }
        };
        self.state = Some((avg_gain, avg_loss));

        if avg_loss <= f64::EPSILON && avg_gain <= f64::EPSILON {
            return Some(50.0);
        }
        if avg_loss <= f64::EPSILON {
            return Some(100.0);
        }
        if avg_gain <= f64::EPSILON {
            return Some(0.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

/// Streaming indicator pipeline for one asset
#[derive(Debug)]
pub struct IndicatorPipeline {
    asset: Asset,
    cfg: IndicatorConfig,
    /// Bounded candle window; capacity covers the longest lookback
    window: VecDeque<Candle>,
    ema_fast: Ema,
    ema_slow: Ema,
    atr: Atr,
    rsi: Rsi,
    /// Session VWAP accumulators
    vwap_pv: f64,
    vwap_vol: f64,
    vwap_day: Option<i64>,
    state: IndicatorState,
}

impl IndicatorPipeline {
    pub fn new(asset: Asset, cfg: IndicatorConfig) -> Self {
        Self {
            asset,
            ema_fast: Ema::new(cfg.ema_fast),
            ema_slow: Ema::new(cfg.ema_slow),
            atr: Atr::new(cfg.atr_period),
            rsi: Rsi::new(cfg.rsi_period),
            window: VecDeque::with_capacity(cfg.window_capacity),
            vwap_pv: 0.0,
            vwap_vol: 0.0,
            vwap_day: None,
            state: IndicatorState::default(),
            cfg,
        }
    }

    pub fn state(&self) -> &IndicatorState {
        &self.state
    }

    pub fn candle_count(&self) -> usize {
        self.window.len()
    }

    /// Fold one closed candle into the pipeline. Rejects out-of-order
    /// candles; the caller skips the cycle on error.
    pub fn on_closed_candle(&mut self, candle: &Candle) -> Result<&IndicatorState, EngineError> {
        if candle.asset != self.asset {
            return Err(EngineError::Data {
                asset: candle.asset,
                detail: format!("candle routed to {} pipeline", self.asset),
            });
        }
        if let Some(last) = self.window.back() {
            if candle.open_time <= last.open_time {
                return Err(EngineError::Data {
                    asset: candle.asset,
                    detail: format!(
                        "out-of-order candle: {} after {}",
                        candle.open_time, last.open_time
                    ),
                });
            }
        }
        if !(candle.low <= candle.high
            && candle.volume >= 0.0
            && candle.open.is_finite()
            && candle.close.is_finite())
        {
            return Err(EngineError::Data {
                asset: candle.asset,
                detail: "malformed candle".to_string(),
            });
        }

        if self.window.len() == self.cfg.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(candle.clone());

        self.state.ts = candle.open_time;
        self.state.close = candle.close;
        self.state.sma = self.compute_sma();
        self.state.ema_fast = self.ema_fast.update(candle.close);
        self.state.ema_slow = self.ema_slow.update(candle.close);
        self.state.atr = self.atr.update(candle);
        self.state.rsi = self.rsi.update(candle.close);
        self.state.vwap = self.update_vwap(candle);

        if let (Some(fast), Some(slow)) = (self.state.ema_fast, self.state.ema_slow) {
            if self.state.ema_spread_history.len() == SPREAD_HISTORY {
                self.state.ema_spread_history.pop_front();
            }
            self.state.ema_spread_history.push_back(fast - slow);
        }

        Ok(&self.state)
    }

    fn compute_sma(&self) -> Option<f64> {
        let period = self.cfg.sma_period;
        if self.window.len() < period {
            return None;
        }
        let sum: f64 = self
            .window
            .iter()
            .rev()
            .take(period)
            .map(|c| c.close)
            .sum();
        Some(sum / period as f64)
    }

    fn update_vwap(&mut self, candle: &Candle) -> Option<f64> {
        match self.cfg.vwap_reset {
            VwapReset::Session => {
                let day = candle.open_time.div_euclid(86_400_000);
                if self.vwap_day != Some(day) {
                    self.vwap_pv = 0.0;
                    self.vwap_vol = 0.0;
                    self.vwap_day = Some(day);
                }
                self.vwap_pv += candle.typical_price() * candle.volume;
                self.vwap_vol += candle.volume;
                if self.vwap_vol > 0.0 {
                    Some(self.vwap_pv / self.vwap_vol)
                } else {
                    None
                }
            }
            VwapReset::Rolling(n) => {
                if self.window.len() < n {
                    return None;
                }
                let mut pv = 0.0;
                let mut vol = 0.0;
                for c in self.window.iter().rev().take(n) {
                    pv += c.typical_price() * c.volume;
                    vol += c.volume;
                }
                if vol > 0.0 {
                    Some(pv / vol)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> IndicatorConfig {
        IndicatorConfig {
            sma_period: 5,
            ema_fast: 3,
            ema_slow: 5,
            atr_period: 3,
            rsi_period: 3,
            vwap_reset: VwapReset::Session,
            window_capacity: 50,
        }
    }

    fn make_candle(ts: i64, close: f64) -> Candle {
        Candle {
            open_time: ts,
            asset: Asset::BTC,
            open: close - 10.0,
            high: close + 20.0,
            low: close - 20.0,
            close,
            volume: 1000.0,
        }
    }

    fn feed(pipeline: &mut IndicatorPipeline, closes: &[f64]) {
        for (i, close) in closes.iter().enumerate() {
            pipeline
                .on_closed_candle(&make_candle(1_700_000_000_000 + i as i64 * 300_000, *close))
                .unwrap();
        }
    }

    /// Batch EMA per the standard definition: SMA seed, then recursive.
    fn batch_ema(closes: &[f64], period: usize) -> Option<f64> {
        if closes.len() < period {
            return None;
        }
        let mut ema = closes[..period].iter().sum::<f64>() / period as f64;
        let k = 2.0 / (period as f64 + 1.0);
        for close in &closes[period..] {
            ema = (close - ema) * k + ema;
        }
        Some(ema)
    }

    /// Batch RSI with Wilder's smoothing over the full history.
    fn batch_rsi(closes: &[f64], period: usize) -> Option<f64> {
        if closes.len() < period + 1 {
            return None;
        }
        let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
        let mut avg_gain =
            changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period as f64;
        let mut avg_loss =
            changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period as f64;
        let n = period as f64;
        for change in &changes[period..] {
            avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
            avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        }
        if avg_loss <= f64::EPSILON {
            return Some(100.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    #[test]
    fn test_warming_up_reports_none_not_defaults() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        feed(&mut pipeline, &[100.0, 101.0]);
        let state = pipeline.state();
        assert!(state.sma.is_none());
        assert!(state.atr.is_none());
        assert!(state.rsi.is_none());
        assert!(!state.is_ready());
    }

    #[test]
    fn test_ready_after_longest_lookback() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        feed(&mut pipeline, &closes);
        assert!(pipeline.state().is_ready());
    }

    #[test]
    fn test_incremental_ema_matches_batch() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.2)
            .collect();
        feed(&mut pipeline, &closes);
        let state = pipeline.state();
        let expected_fast = batch_ema(&closes, 3).unwrap();
        let expected_slow = batch_ema(&closes, 5).unwrap();
        assert!((state.ema_fast.unwrap() - expected_fast).abs() < 1e-9);
        assert!((state.ema_slow.unwrap() - expected_slow).abs() < 1e-9);
    }

    #[test]
    fn test_incremental_rsi_matches_batch() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 1.3).cos() * 4.0)
            .collect();
        feed(&mut pipeline, &closes);
        let expected = batch_rsi(&closes, 3).unwrap();
        assert!((pipeline.state().rsi.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_incremental_atr_matches_batch() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 7) as f64 * 3.0).collect();
        feed(&mut pipeline, &closes);

        // Batch Wilder ATR over the same candles
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| make_candle(1_700_000_000_000 + i as i64 * 300_000, *c))
            .collect();
        let trs: Vec<f64> = candles
            .windows(2)
            .map(|w| {
                (w[1].high - w[1].low)
                    .max((w[1].high - w[0].close).abs())
                    .max((w[1].low - w[0].close).abs())
            })
            .collect();
        let mut atr = trs[..3].iter().sum::<f64>() / 3.0;
        for tr in &trs[3..] {
            atr += (tr - atr) / 3.0;
        }
        assert!((pipeline.state().atr.unwrap() - atr).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_is_100_when_no_losses() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64 * 5.0).collect();
        feed(&mut pipeline, &closes);
        assert_eq!(pipeline.state().rsi, Some(100.0));
    }

    #[test]
    fn test_out_of_order_candle_rejected() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        pipeline
            .on_closed_candle(&make_candle(1_700_000_000_000, 100.0))
            .unwrap();
        let err = pipeline
            .on_closed_candle(&make_candle(1_700_000_000_000, 101.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Data { .. }));
    }

    #[test]
    fn test_session_vwap_resets_at_day_boundary() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        // Two candles late in one UTC day, one in the next
        let day_ms = 86_400_000i64;
        let mut c1 = make_candle(day_ms - 600_000, 100.0);
        c1.volume = 10.0;
        let mut c2 = make_candle(day_ms - 300_000, 200.0);
        c2.volume = 10.0;
        let mut c3 = make_candle(day_ms + 300_000, 300.0);
        c3.volume = 10.0;
        pipeline.on_closed_candle(&c1).unwrap();
        pipeline.on_closed_candle(&c2).unwrap();
        let vwap_before = pipeline.state().vwap.unwrap();
        pipeline.on_closed_candle(&c3).unwrap();
        let vwap_after = pipeline.state().vwap.unwrap();
        // After the reset only c3 contributes
        assert!((vwap_after - c3.typical_price()).abs() < 1e-9);
        assert!(vwap_before < vwap_after);
    }

    #[test]
    fn test_ema_trend_follows_crossover() {
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 2.0).collect();
        feed(&mut pipeline, &closes);
        assert_eq!(pipeline.state().ema_trend(), Some(Direction::Long));

        // Sharp downtrend flips the fast EMA under the slow one
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, test_cfg());
        closes = (0..20).map(|i| 200.0 - i as f64 * 2.0).collect();
        feed(&mut pipeline, &closes);
        assert_eq!(pipeline.state().ema_trend(), Some(Direction::Short));
    }

    #[test]
    fn test_window_stays_bounded() {
        let mut cfg = test_cfg();
        cfg.window_capacity = 10;
        let mut pipeline = IndicatorPipeline::new(Asset::BTC, cfg);
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        feed(&mut pipeline, &closes);
        assert_eq!(pipeline.candle_count(), 10);
    }
}
