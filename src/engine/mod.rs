//! Engine orchestration
//!
//! One task per contract owns that symbol's entire pipeline: indicators,
//! analyzer, signal engine and lifecycle manager. Tasks share the risk
//! manager and the snapshot store behind `Arc` and otherwise never touch
//! each other's state, so a symbol can never hold two positions and
//! cross-symbol races cannot arise.
//!
//! Each closed candle runs the strict cycle: indicators, confirmation
//! metrics, signal evaluation, risk authorization, order submission.
//! Computation failures skip the cycle; they never crash the task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analyzer::MarketAnalyzer;
use crate::config::AppConfig;
use crate::error::RiskDenial;
use crate::gateway::{GatewayAdapter, GatewayEvent};
use crate::indicators::IndicatorPipeline;
use crate::lifecycle::{FillOutcome, LifecycleManager, Position, PositionState};
use crate::notify::{Command, EngineEvent, Notifier};
use crate::persistence::Store;
use crate::risk::RiskManager;
use crate::signal::SignalEngine;
use crate::types::{Asset, Fill, MarketUpdate, Signal};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-symbol engine task state
pub struct SymbolEngine {
    asset: Asset,
    cfg: AppConfig,
    pipeline: IndicatorPipeline,
    analyzer: MarketAnalyzer,
    signals: SignalEngine,
    lifecycle: LifecycleManager,
    risk: Arc<RiskManager>,
    store: Arc<Store>,
    gateway: Arc<dyn GatewayAdapter>,
    notifier: Notifier,
    paused: bool,
    /// Reconciliation mismatch; no automated actions until an operator
    /// restarts the engine with the discrepancy resolved
    manual_review: bool,
}

impl SymbolEngine {
    pub fn new(
        asset: Asset,
        cfg: AppConfig,
        gateway: Arc<dyn GatewayAdapter>,
        risk: Arc<RiskManager>,
        store: Arc<Store>,
        notifier: Notifier,
    ) -> Self {
        Self {
            pipeline: IndicatorPipeline::new(asset, cfg.indicators.clone()),
            analyzer: MarketAnalyzer::new(cfg.analyzer.clone()),
            signals: SignalEngine::new(cfg.signal.clone()),
            lifecycle: LifecycleManager::new(
                asset,
                cfg.lifecycle.clone(),
                gateway.clone(),
                notifier.clone(),
            ),
            asset,
            cfg,
            risk,
            store,
            gateway,
            notifier,
            paused: false,
            manual_review: false,
        }
    }

    pub fn is_under_review(&self) -> bool {
        self.manual_review
    }

    /// Compare the persisted position against what the venue reports.
    /// Agreement adopts the position; any discrepancy parks the symbol in
    /// manual review rather than guessing.
    pub async fn reconcile(&mut self, persisted: Option<Position>) -> Result<()> {
        let live = self
            .gateway
            .live_position(self.asset)
            .await
            .with_context(|| format!("querying live position for {}", self.asset))?;

        match (persisted, live) {
            (None, None) => Ok(()),
            (Some(local), Some(venue))
                if local.direction == venue.direction
                    && (local.remaining_qty - venue.size).abs() < 1e-9 =>
            {
                info!(asset = %self.asset, qty = venue.size, "adopted position from snapshot");
                self.lifecycle.restore(local);
                Ok(())
            }
            (local, venue) => {
                let detail = format!(
                    "snapshot {:?} vs venue {:?}",
                    local.map(|p| (p.direction, p.remaining_qty)),
                    venue.map(|p| (p.direction, p.size)),
                );
                self.manual_review = true;
                self.notifier.publish(EngineEvent::ManualReview {
                    asset: self.asset,
                    detail,
                });
                Ok(())
            }
        }
    }

    /// Route one market update through the pipeline
    pub async fn handle_market(&mut self, update: MarketUpdate, now_ms: i64) {
        if self.manual_review {
            return;
        }
        match update {
            MarketUpdate::Book(book) => self.analyzer.on_book(book),
            MarketUpdate::Trade(trade) => {
                let price = trade.price;
                self.analyzer.on_trade(trade);
                self.lifecycle.on_price(price).await;
            }
            MarketUpdate::Candle(candle) => {
                // The pipeline validates first; a rejected candle must not
                // touch the confirmation windows or the trailing stop either
                let state = match self.pipeline.on_closed_candle(&candle) {
                    Ok(state) => state.clone(),
                    Err(err) => {
                        warn!(asset = %self.asset, %err, "candle rejected, skipping cycle");
                        return;
                    }
                };
                self.analyzer.on_closed_candle(&candle);
                self.lifecycle.on_price(candle.close).await;
                if self.risk.maybe_roll(now_ms).await {
                    self.notifier.publish(EngineEvent::DailyReset);
                }
                if self.paused || !self.lifecycle.state().is_flat() {
                    return;
                }
                let confirmation = self.analyzer.confirmation(now_ms);
                if let Some(signal) = self.signals.evaluate(self.asset, &state, &confirmation) {
                    self.notifier.publish(EngineEvent::SignalGenerated(signal.clone()));
                    self.act_on_signal(signal, now_ms).await;
                }
            }
        }
    }

    /// Risk-check a confirmed signal and submit the entry
    async fn act_on_signal(&mut self, signal: Signal, now_ms: i64) {
        let margin = match self.gateway.query_margin().await {
            Ok(margin) => margin,
            Err(err) => {
                warn!(asset = %self.asset, %err, "margin query failed, skipping signal");
                return;
            }
        };
        let min_distance = signal.entry_price * self.asset.min_stop_distance_pct() / 100.0;
        let stop_distance = (signal.atr * self.cfg.lifecycle.stop_atr_mult).max(min_distance);

        match self
            .risk
            .authorize(self.asset, signal.entry_price, stop_distance, margin, now_ms)
            .await
        {
            Ok(qty) => {
                if let Err(err) = self.lifecycle.submit_entry(&signal, qty, now_ms).await {
                    warn!(asset = %self.asset, %err, "entry submission failed");
                }
            }
            Err(denial) => {
                // The halt itself is reported once, at the moment it latches
                if matches!(
                    denial,
                    RiskDenial::DailyLoss { .. } | RiskDenial::ConsecutiveLosses { .. }
                ) {
                    self.notifier.publish(EngineEvent::RiskHalted {
                        reason: denial.clone(),
                    });
                }
                self.notifier.publish(EngineEvent::SignalDenied {
                    asset: self.asset,
                    reason: denial,
                });
            }
        }
    }

    /// Apply a fill and update risk counters and snapshots
    pub async fn handle_fill(&mut self, fill: &Fill, now_ms: i64) {
        if self.manual_review {
            warn!(asset = %self.asset, order_id = %fill.order_id,
                "fill received while under manual review, not applied");
            return;
        }
        match self.lifecycle.on_fill(fill, now_ms).await {
            Ok(FillOutcome::EntryFilled) => {
                self.risk.record_entry_fill(now_ms).await;
                self.persist().await;
            }
            Ok(FillOutcome::PartialClose) => self.persist().await,
            Ok(FillOutcome::Closed { realized_pnl }) => {
                if let Some(halt) = self.risk.record_realized_pnl(realized_pnl, now_ms).await {
                    self.notifier.publish(EngineEvent::RiskHalted { reason: halt });
                }
                self.persist().await;
            }
            Ok(FillOutcome::Ignored) => {}
            Err(err) => error!(asset = %self.asset, %err, "fill handling failed"),
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause => {
                self.paused = true;
                info!(asset = %self.asset, "entries paused");
            }
            Command::Resume => {
                self.paused = false;
                info!(asset = %self.asset, "entries resumed");
            }
            Command::CloseAll => {
                if let Err(err) = self.lifecycle.close_all().await {
                    error!(asset = %self.asset, %err, "close-all failed");
                }
            }
            Command::Status => {
                let snapshot = self.risk.snapshot().await;
                let state = match self.lifecycle.state() {
                    PositionState::Idle => "idle",
                    PositionState::EntryPending(_) => "entry_pending",
                    PositionState::Open(_) => "open",
                    PositionState::PartiallyClosed(_) => "partially_closed",
                    PositionState::Closed => "closed",
                };
                self.notifier.publish(EngineEvent::Status {
                    asset: self.asset,
                    state: state.into(),
                    paused: self.paused,
                    daily_pnl: snapshot.daily_realized_pnl,
                    daily_trades: snapshot.daily_trade_count,
                });
            }
        }
    }

    /// Periodic maintenance tick
    pub async fn sweep(&mut self, now_ms: i64) {
        if self.manual_review {
            return;
        }
        if let Err(err) = self.lifecycle.sweep(now_ms).await {
            warn!(asset = %self.asset, %err, "lifecycle sweep failed");
        }
        if self.risk.maybe_roll(now_ms).await {
            self.notifier.publish(EngineEvent::DailyReset);
        }
    }

    async fn persist(&self) {
        let risk = self.risk.snapshot().await;
        if let Err(err) = self.store.save_risk(&risk).await {
            error!(asset = %self.asset, %err, "risk snapshot failed");
        }
        let position = self.lifecycle.state().position().cloned();
        if let Err(err) = self.store.save_position(self.asset, position.as_ref()).await {
            error!(asset = %self.asset, %err, "position snapshot failed");
        }
    }

    /// Drive this symbol until the gateway stream closes
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<GatewayEvent>,
        mut commands: broadcast::Receiver<Command>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.cfg.gateway.sweep_interval_ms,
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(asset = %self.asset, "symbol engine running");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(GatewayEvent::Market(update)) if update.asset() == self.asset => {
                        self.handle_market(update, now_ms()).await;
                    }
                    Ok(GatewayEvent::Fill(fill)) if fill.asset == self.asset => {
                        self.handle_fill(&fill, now_ms()).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(asset = %self.asset, skipped, "gateway stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = commands.recv() => match command {
                    Ok(command) => self.handle_command(command).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => self.sweep(now_ms()).await,
            }
        }
        info!(asset = %self.asset, "symbol engine stopped");
    }
}

/// Running engine: spawned symbol tasks plus the operator surface
pub struct Engine {
    notifier: Notifier,
    commands: broadcast::Sender<Command>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_drain: Duration,
}

impl Engine {
    /// Wire up shared state, reconcile every symbol and spawn its task
    pub async fn start(cfg: AppConfig, gateway: Arc<dyn GatewayAdapter>) -> Result<Self> {
        let store = Arc::new(Store::new(cfg.persistence.data_dir.clone()));
        store.init().await?;

        let now = now_ms();
        let risk = Arc::new(match store.load_risk().await? {
            Some(snapshot) => RiskManager::restore(cfg.risk.clone(), snapshot, now),
            None => RiskManager::new(cfg.risk.clone(), now),
        });

        let notifier = Notifier::new(256);
        let (commands, _) = broadcast::channel(16);

        let assets: Vec<Asset> = cfg
            .bot
            .assets
            .iter()
            .filter_map(|name| Asset::parse(name))
            .collect();

        let mut tasks = Vec::with_capacity(assets.len());
        for asset in assets {
            gateway
                .set_leverage(asset, cfg.risk.leverage)
                .await
                .with_context(|| format!("setting leverage for {asset}"))?;

            let mut symbol = SymbolEngine::new(
                asset,
                cfg.clone(),
                gateway.clone(),
                risk.clone(),
                store.clone(),
                notifier.clone(),
            );
            let persisted = store.load_position(asset).await?;
            symbol.reconcile(persisted).await?;

            let events = gateway.subscribe();
            let command_rx = commands.subscribe();
            tasks.push(tokio::spawn(symbol.run(events, command_rx)));
        }

        info!(config = %cfg, "engine started");
        Ok(Self {
            notifier,
            commands,
            tasks,
            shutdown_drain: Duration::from_millis(cfg.gateway.shutdown_drain_ms),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.notifier.subscribe()
    }

    pub fn command(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    /// Close positions, drain the symbol tasks and stop them
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::CloseAll);
        // The tasks keep running through the drain window so the close
        // fills come back, get booked and get persisted
        tokio::time::sleep(self.shutdown_drain).await;
        // Closing the command channel breaks each task out of its loop
        drop(self.commands);
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("symbol task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AnalyzerConfig, BotConfig, GatewayConfig, IndicatorConfig, LifecycleConfig,
        PersistenceConfig, RiskConfig, SignalConfig, TpLevelConfig, VwapReset,
    };
    use crate::gateway::PaperGateway;
    use crate::types::{Direction, LivePosition, OrderId};
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            bot: BotConfig {
                tag: "test".into(),
                assets: vec!["BTC".into()],
                dry_run: true,
            },
            indicators: IndicatorConfig {
                sma_period: 5,
                ema_fast: 3,
                ema_slow: 5,
                atr_period: 3,
                rsi_period: 3,
                vwap_reset: VwapReset::Session,
                window_capacity: 50,
            },
            analyzer: AnalyzerConfig {
                book_depth: 5,
                volume_lookback: 4,
                trade_window_ms: 60_000,
                max_age_ms: 10_000,
            },
            signal: SignalConfig {
                trend_weight: 0.6,
                vwap_weight: 0.4,
                rsi_overbought: 70.0,
                rsi_oversold: 30.0,
                vwap_band_atr: 1.0,
                min_relative_volume: 1.2,
                min_imbalance: 0.05,
            },
            risk: RiskConfig {
                risk_per_trade: 10.0,
                max_position_qty: 0.05,
                max_trades_per_day: 12,
                max_daily_loss: 100.0,
                max_consecutive_losses: 3,
                leverage: 3,
                min_leverage: 1,
                max_leverage: 5,
                reset_hour_utc: 0,
                persist_halt: true,
            },
            lifecycle: LifecycleConfig {
                stop_atr_mult: 1.5,
                tp_levels: vec![
                    TpLevelConfig { atr_mult: 1.0, fraction: 0.5 },
                    TpLevelConfig { atr_mult: 2.0, fraction: 0.5 },
                ],
                trailing_stop_pct: 0.2,
                trail_min_step_pct: 0.1,
                entry_timeout_ms: 60_000,
                max_retries: 3,
                retry_backoff_ms: 1,
            },
            gateway: GatewayConfig {
                margin_refresh_secs: 300,
                sweep_interval_ms: 1_000,
                shutdown_drain_ms: 300,
            },
            persistence: PersistenceConfig {
                data_dir: std::env::temp_dir()
                    .join(format!("scalpbot-engine-{}", Uuid::new_v4()))
                    .to_string_lossy()
                    .into_owned(),
            },
        }
    }

    fn symbol_engine(gateway: Arc<PaperGateway>, cfg: AppConfig) -> SymbolEngine {
        let now = 1_700_000_000_000;
        let risk = Arc::new(RiskManager::new(cfg.risk.clone(), now));
        let store = Arc::new(Store::new(cfg.persistence.data_dir.clone()));
        SymbolEngine::new(Asset::BTC, cfg, gateway, risk, store, Notifier::new(64))
    }

    fn sample_position() -> Position {
        Position {
            direction: Direction::Long,
            entry_price: 50_000.0,
            atr: 100.0,
            initial_qty: 0.02,
            remaining_qty: 0.02,
            stop_price: 49_850.0,
            stop_order_id: OrderId("stop-1".into()),
            tp_orders: vec![],
            realized_pnl: 0.0,
            extreme_price: 50_000.0,
        }
    }

    #[tokio::test]
    async fn test_reconcile_flat_on_both_sides() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut engine = symbol_engine(gateway, test_config());
        engine.reconcile(None).await.unwrap();
        assert!(!engine.is_under_review());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_matching_position() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway
            .set_position(LivePosition {
                asset: Asset::BTC,
                direction: Direction::Long,
                size: 0.02,
                entry_price: 50_000.0,
            })
            .await;
        let mut engine = symbol_engine(gateway, test_config());
        engine.reconcile(Some(sample_position())).await.unwrap();
        assert!(!engine.is_under_review());
        assert!(engine.lifecycle.state().position().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_mismatch_enters_manual_review() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway
            .set_position(LivePosition {
                asset: Asset::BTC,
                direction: Direction::Short,
                size: 0.02,
                entry_price: 50_000.0,
            })
            .await;
        let mut engine = symbol_engine(gateway.clone(), test_config());
        let mut events = engine.notifier.subscribe();
        engine.reconcile(Some(sample_position())).await.unwrap();
        assert!(engine.is_under_review());
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::ManualReview { asset: Asset::BTC, .. }
        ));

        // Under review: market data and fills are ignored
        engine
            .handle_market(
                MarketUpdate::Trade(crate::types::TradeTick {
                    ts: 1,
                    asset: Asset::BTC,
                    price: 50_000.0,
                    qty: 1.0,
                    side: crate::types::TradeSide::Buy,
                }),
                1,
            )
            .await;
        assert_eq!(gateway.orders_placed().await, 0);
    }

    #[tokio::test]
    async fn test_venue_position_without_snapshot_is_reviewed() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway
            .set_position(LivePosition {
                asset: Asset::BTC,
                direction: Direction::Long,
                size: 0.02,
                entry_price: 50_000.0,
            })
            .await;
        let mut engine = symbol_engine(gateway, test_config());
        engine.reconcile(None).await.unwrap();
        assert!(engine.is_under_review());
    }

    #[tokio::test]
    async fn test_pause_blocks_entries_resume_restores() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut engine = symbol_engine(gateway, test_config());
        engine.handle_command(Command::Pause).await;
        assert!(engine.paused);
        engine.handle_command(Command::Resume).await;
        assert!(!engine.paused);
    }

    fn flat_candle(open_time: i64, volume: f64) -> crate::types::Candle {
        crate::types::Candle {
            open_time,
            asset: Asset::BTC,
            open: 50_000.0,
            high: 50_010.0,
            low: 49_990.0,
            close: 50_000.0,
            volume,
        }
    }

    #[tokio::test]
    async fn test_rejected_candle_leaves_confirmation_untouched() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut engine = symbol_engine(gateway, test_config());
        engine
            .handle_market(MarketUpdate::Candle(flat_candle(60_000, 1_000.0)), 61_000)
            .await;
        engine
            .handle_market(MarketUpdate::Candle(flat_candle(120_000, 1_000.0)), 121_000)
            .await;
        let before = engine.analyzer.confirmation(121_000);
        assert!(!before.stale);

        // A replayed candle with a spike volume is rejected upstream and
        // must not skew the relative-volume baseline
        engine
            .handle_market(MarketUpdate::Candle(flat_candle(60_000, 9_000.0)), 121_000)
            .await;
        assert_eq!(engine.analyzer.confirmation(121_000), before);
    }

    #[tokio::test]
    async fn test_shutdown_books_close_fill_before_teardown() {
        let cfg = test_config();
        let paper = Arc::new(PaperGateway::new(10_000.0));
        paper
            .set_position(LivePosition {
                asset: Asset::BTC,
                direction: Direction::Long,
                size: 0.02,
                entry_price: 50_000.0,
            })
            .await;
        let store = Arc::new(Store::new(cfg.persistence.data_dir.clone()));
        store.init().await.unwrap();
        store
            .save_position(Asset::BTC, Some(&sample_position()))
            .await
            .unwrap();

        let engine = Engine::start(cfg, paper.clone()).await.unwrap();
        // Fill the operator close as soon as it rests at the venue
        let filler = {
            let paper = paper.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let ids = paper.open_order_ids().await;
                    if let Some(id) = ids.first() {
                        paper.fill(id, 50_050.0, 1_700_000_100_000).await.unwrap();
                        return;
                    }
                }
                panic!("close order never reached the venue");
            })
        };
        engine.shutdown().await;
        filler.await.unwrap();

        // The close fill was applied and the snapshot cleared in time
        assert!(store.load_position(Asset::BTC).await.unwrap().is_none());
    }
}
