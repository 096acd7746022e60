//! Configuration management for ScalpBot
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub indicators: IndicatorConfig,
    pub analyzer: AnalyzerConfig,
    pub signal: SignalConfig,
    pub risk: RiskConfig,
    pub lifecycle: LifecycleConfig,
    pub gateway: GatewayConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// Contracts to trade
    pub assets: Vec<String>,
    /// Dry run mode (paper gateway, no real orders)
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorConfig {
    /// SMA period
    pub sma_period: usize,
    /// Fast EMA period
    pub ema_fast: usize,
    /// Slow EMA period
    pub ema_slow: usize,
    /// ATR period (Wilder)
    pub atr_period: usize,
    /// RSI period (Wilder)
    pub rsi_period: usize,
    /// VWAP reset: "session" (daily) or a rolling candle count
    pub vwap_reset: VwapReset,
    /// Candle window capacity; must cover the longest lookback
    pub window_capacity: usize,
}

/// VWAP accumulation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "candles")]
pub enum VwapReset {
    /// Reset at the UTC session boundary
    Session,
    /// Rolling window of the last N candles
    Rolling(usize),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Order-book levels per side used for the imbalance ratio
    pub book_depth: usize,
    /// Closed candles averaged for the relative-volume baseline
    pub volume_lookback: usize,
    /// Sliding window for aggressor buy/sell volume, in milliseconds
    pub trade_window_ms: i64,
    /// Market data older than this is stale, in milliseconds
    pub max_age_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// Weight of the EMA-crossover trend rule
    pub trend_weight: f64,
    /// Weight of the VWAP-band rule
    pub vwap_weight: f64,
    /// RSI exhaustion bounds
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// VWAP deviation band in ATR multiples
    pub vwap_band_atr: f64,
    /// Minimum relative volume to confirm a signal
    pub min_relative_volume: f64,
    /// Minimum absolute imbalance to count as agreement
    pub min_imbalance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Currency risked per trade (USDT)
    pub risk_per_trade: f64,
    /// Absolute position size cap in base units
    pub max_position_qty: f64,
    /// Maximum trades per day
    pub max_trades_per_day: u32,
    /// Maximum daily realized loss (USDT), halts entries when crossed
    pub max_daily_loss: f64,
    /// Consecutive losing trades before halting entries
    pub max_consecutive_losses: u32,
    /// Leverage applied at startup
    pub leverage: u32,
    /// Allowed leverage bounds
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Hour (UTC) at which daily counters reset; 0 = midnight UTC
    pub reset_hour_utc: u32,
    /// Whether a risk halt survives restart
    pub persist_halt: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Stop distance in ATR multiples
    pub stop_atr_mult: f64,
    /// Take-profit ladder: ATR multiple and size fraction per level
    pub tp_levels: Vec<TpLevelConfig>,
    /// Trailing stop distance from the favorable extreme (%)
    pub trailing_stop_pct: f64,
    /// Minimum stop improvement worth amending at the venue (%)
    pub trail_min_step_pct: f64,
    /// Cancel an unfilled entry after this long, in milliseconds
    pub entry_timeout_ms: i64,
    /// Bounded retry budget for transient gateway errors
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt, in milliseconds
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TpLevelConfig {
    /// Target distance from entry in ATR multiples
    pub atr_mult: f64,
    /// Fraction of the position closed at this level
    pub fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Margin refresh interval in seconds
    pub margin_refresh_secs: u64,
    /// Lifecycle sweep interval (timeouts, staleness) in milliseconds
    pub sweep_interval_ms: u64,
    /// How long shutdown lets close-all fills drain before stopping tasks
    pub shutdown_drain_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for durable snapshots
    pub data_dir: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.assets", vec!["BTC"])?
            .set_default("bot.dry_run", true)?
            // Indicator defaults
            .set_default("indicators.sma_period", 50)?
            .set_default("indicators.ema_fast", 9)?
            .set_default("indicators.ema_slow", 21)?
            .set_default("indicators.atr_period", 14)?
            .set_default("indicators.rsi_period", 14)?
            .set_default("indicators.vwap_reset.mode", "session")?
            .set_default("indicators.window_capacity", 200)?
            // Analyzer defaults
            .set_default("analyzer.book_depth", 10)?
            .set_default("analyzer.volume_lookback", 20)?
            .set_default("analyzer.trade_window_ms", 60_000)?
            .set_default("analyzer.max_age_ms", 10_000)?
            // Signal defaults
            .set_default("signal.trend_weight", 0.6)?
            .set_default("signal.vwap_weight", 0.4)?
            .set_default("signal.rsi_overbought", 70.0)?
            .set_default("signal.rsi_oversold", 30.0)?
            .set_default("signal.vwap_band_atr", 1.0)?
            .set_default("signal.min_relative_volume", 1.2)?
            .set_default("signal.min_imbalance", 0.05)?
            // Risk defaults
            .set_default("risk.risk_per_trade", 10.0)?
            .set_default("risk.max_position_qty", 0.05)?
            .set_default("risk.max_trades_per_day", 12)?
            .set_default("risk.max_daily_loss", 100.0)?
            .set_default("risk.max_consecutive_losses", 3)?
            .set_default("risk.leverage", 3)?
            .set_default("risk.min_leverage", 1)?
            .set_default("risk.max_leverage", 5)?
            .set_default("risk.reset_hour_utc", 0)?
            .set_default("risk.persist_halt", true)?
            // Lifecycle defaults: stop at 1.5 ATR, two-level ladder
            .set_default("lifecycle.stop_atr_mult", 1.5)?
            .set_default(
                "lifecycle.tp_levels",
                vec![
                    std::collections::HashMap::from([
                        ("atr_mult".to_string(), 1.0),
                        ("fraction".to_string(), 0.5),
                    ]),
                    std::collections::HashMap::from([
                        ("atr_mult".to_string(), 2.0),
                        ("fraction".to_string(), 0.5),
                    ]),
                ],
            )?
            .set_default("lifecycle.trailing_stop_pct", 0.2)?
            .set_default("lifecycle.trail_min_step_pct", 0.1)?
            .set_default("lifecycle.entry_timeout_ms", 60_000)?
            .set_default("lifecycle.max_retries", 3)?
            .set_default("lifecycle.retry_backoff_ms", 500)?
            // Gateway defaults
            .set_default("gateway.margin_refresh_secs", 300)?
            .set_default("gateway.sweep_interval_ms", 1_000)?
            .set_default("gateway.shutdown_drain_ms", 500)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SCALPBOT_*)
            .add_source(Environment::with_prefix("SCALPBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject out-of-range values before the engine starts
    pub fn validate(&self) -> Result<()> {
        if self.bot.assets.is_empty() {
            bail!("bot.assets must name at least one contract");
        }
        for a in &self.bot.assets {
            if crate::types::Asset::parse(a).is_none() {
                bail!("unsupported asset {a}; only USDT-margined contracts are supported");
            }
        }
        if self.risk.leverage < self.risk.min_leverage
            || self.risk.leverage > self.risk.max_leverage
        {
            bail!(
                "leverage {} outside allowed range [{}, {}]",
                self.risk.leverage,
                self.risk.min_leverage,
                self.risk.max_leverage
            );
        }
        if self.risk.risk_per_trade <= 0.0 {
            bail!("risk.risk_per_trade must be positive");
        }
        if !(1..=20).contains(&self.risk.max_trades_per_day) {
            bail!("risk.max_trades_per_day must be within 1..=20");
        }
        if self.risk.reset_hour_utc > 23 {
            bail!("risk.reset_hour_utc must be within 0..=23");
        }
        if self.lifecycle.tp_levels.is_empty() {
            bail!("lifecycle.tp_levels must define at least one level");
        }
        let frac_sum: f64 = self.lifecycle.tp_levels.iter().map(|l| l.fraction).sum();
        if frac_sum > 1.0 + 1e-9 {
            bail!("take-profit fractions sum to {frac_sum:.3}, must be <= 1.0");
        }
        let mut prev = 0.0;
        for level in &self.lifecycle.tp_levels {
            if level.atr_mult <= prev {
                bail!("take-profit levels must use strictly increasing ATR multiples");
            }
            if level.fraction <= 0.0 {
                bail!("take-profit fractions must be positive");
            }
            prev = level.atr_mult;
        }
        let longest = self
            .indicators
            .sma_period
            .max(self.indicators.ema_slow)
            .max(self.indicators.atr_period + 1)
            .max(self.indicators.rsi_period + 1);
        if self.indicators.window_capacity < longest {
            bail!(
                "indicators.window_capacity {} shorter than longest lookback {}",
                self.indicators.window_capacity,
                longest
            );
        }
        Ok(())
    }

    /// Config digest (without secrets) for startup logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} assets={:?} dry_run={} leverage={}x risk_per_trade={:.2} max_daily_loss={:.2}",
            self.bot.tag,
            self.bot.assets,
            self.bot.dry_run,
            self.risk.leverage,
            self.risk.risk_per_trade,
            self.risk.max_daily_loss
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
