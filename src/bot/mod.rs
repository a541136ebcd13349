//! Analysis cycle orchestration
//!
//! One sequential loop on a fixed interval: reload config, fetch candles for
//! the three timeframe roles, score indicators, run confluence, monitor open
//! positions, then act on any new signal. At most one cycle is ever in
//! flight, and every external failure degrades to "skip this cycle's action"
//! — the position list and adaptive weights stay consistent across a failed
//! cycle.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::confluence::{ConfluenceEngine, ScoringConfig, WeightSource};
use crate::executor::{CloseEvent, PositionManager, PositionsSummary};
use crate::indicators::{IndicatorScores, IndicatorSet};
use crate::learning::LearningEngine;
use crate::oracle::CandleSource;
use crate::swap::SwapVenue;
use crate::types::{Candle, TimeframeRole, TradeOutcome, TradeSignal};

pub struct TradingBot {
    config: AppConfig,
    indicators: IndicatorSet,
    confluence: ConfluenceEngine,
    learning: LearningEngine,
    /// Exclusive owner of position state; the lock serializes the cycle
    /// against any concurrent command path.
    positions: Arc<Mutex<PositionManager>>,
    candle_source: Arc<dyn CandleSource>,
    venue: Arc<dyn SwapVenue>,
    /// Originating signal per open position id, for result attribution
    open_signals: HashMap<String, TradeSignal>,
    cycle_count: u64,
}

impl TradingBot {
    pub fn new(
        config: AppConfig,
        candle_source: Arc<dyn CandleSource>,
        venue: Arc<dyn SwapVenue>,
    ) -> Result<Self> {
        let data_dir = Path::new(&config.persistence.data_dir).to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let indicators = IndicatorSet::new(config.indicators.clone());
        let weights = config.confluence.weights.iter().map(|(k, v)| (*k, *v)).collect();
        let confluence = ConfluenceEngine::new(&data_dir, weights);
        let learning = LearningEngine::new(&data_dir, &config);
        let positions = Arc::new(Mutex::new(PositionManager::new(&data_dir)));

        Ok(Self {
            config,
            indicators,
            confluence,
            learning,
            positions,
            candle_source,
            venue,
            open_signals: HashMap::new(),
            cycle_count: 0,
        })
    }

    /// Shared handle for external readers (reports); they receive cloned
    /// snapshots, never live references into the lists.
    pub fn positions_handle(&self) -> Arc<Mutex<PositionManager>> {
        Arc::clone(&self.positions)
    }

    pub fn learning(&self) -> &LearningEngine {
        &self.learning
    }

    pub fn confluence(&self) -> &ConfluenceEngine {
        &self.confluence
    }

    /// Run until ctrl-c, one cycle per interval
    pub async fn run(&mut self) -> Result<()> {
        info!(config = %self.config.digest(), "Bot starting");
        loop {
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "Cycle failed, retrying next interval");
            }
            let interval = Duration::from_secs(self.config.bot.loop_interval_secs.max(1));
            tokio::select! {
                _ = sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// One full analysis cycle. Fetch failures abort the cycle after
    /// logging; nothing is mutated on an aborted cycle.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;

        // Hot-reload configuration; keep the previous one on failure
        match AppConfig::load() {
            Ok(config) => {
                self.indicators.update_config(config.indicators.clone());
                self.learning.update_base(&config);
                self.config = config;
            }
            Err(e) => warn!(error = %e, "Config reload failed, keeping previous"),
        }

        let candles_by_role = match self.fetch_candles().await {
            Some(map) => map,
            None => return Ok(()), // logged inside; retry next cycle
        };
        let exec_candles = match candles_by_role.get(&TimeframeRole::Execution) {
            Some(series) if !series.is_empty() => series.clone(),
            _ => {
                warn!("No execution-timeframe candles, skipping cycle");
                return Ok(());
            }
        };

        // One price per cycle: position checks and the open decision must
        // see the same value.
        let current_price = match self.candle_source.current_price().await {
            Ok(price) if price > 0.0 => price,
            Ok(_) | Err(_) => {
                warn!("No current price available, skipping cycle");
                return Ok(());
            }
        };

        // Learning upkeep before any new decisions
        self.learning.update_future_prices(current_price);
        self.learning.update_shadow_trades(current_price);
        if let Some(report) = self.learning.daily_review() {
            info!(
                date = %report.date,
                accuracy = %format!("{:.0}%", report.accuracy_pct),
                risk_level = %format!("{:.2}", report.risk_level),
                "Daily review"
            );
        }

        let scores_by_tf: BTreeMap<TimeframeRole, IndicatorScores> = candles_by_role
            .iter()
            .map(|(role, series)| (*role, self.indicators.get_all_scores(series)))
            .collect();

        let scoring = self.build_scoring();
        let effective_risk = if self.config.bot.learning_enabled {
            self.learning.effective_risk_per_trade()
        } else {
            self.config.risk.risk_per_trade
        };

        // Monitor existing positions first, against this cycle's price
        let close_events = {
            let mut positions = self.positions.lock().await;
            positions
                .check_positions(current_price, &self.config, self.venue.as_ref())
                .await
        };
        self.handle_close_events(&close_events);

        // Confluence and signal generation
        let symbol = self.config.tokens.pair();
        let conf = self.confluence.calculate_confluence(&scores_by_tf, &scoring);
        let signal =
            self.confluence
                .generate_signal(&symbol, &scores_by_tf, &exec_candles, &scoring);

        let default_scores = IndicatorScores::default();
        let exec_scores = scores_by_tf
            .get(&TimeframeRole::Execution)
            .unwrap_or(&default_scores);
        self.learning.record_analysis(
            current_price,
            &conf,
            exec_scores.rsi.value,
            exec_scores.volume.ratio,
            signal.is_some(),
            self.confluence.last_rejection(),
        );

        match signal {
            Some(signal) => {
                info!(
                    direction = %signal.direction,
                    confidence = %format!("{:.0}%", signal.confidence * 100.0),
                    entry = signal.entry_price,
                    stop = signal.stop_loss,
                    rr = %format!("{:.2}", signal.risk_reward_ratio),
                    "Signal generated"
                );
                if self.config.bot.auto_trading {
                    let opened = {
                        let mut positions = self.positions.lock().await;
                        positions
                            .open_position(
                                &signal,
                                current_price,
                                &self.config,
                                effective_risk,
                                self.venue.as_ref(),
                            )
                            .await
                    };
                    if let Some(position) = opened {
                        // A signal is consumed exactly once
                        self.open_signals.insert(position.id.clone(), signal);
                    }
                }
            }
            None => {
                if let Some(reason) = self.confluence.last_rejection() {
                    info!(%reason, confidence = %format!("{:.2}", conf.confidence), "No signal");
                }
                // Grey-zone confidence: open a shadow trade for evaluation
                if self.config.bot.learning_enabled
                    && self.learning.should_open_shadow_trade(&conf)
                {
                    let entry = exec_candles.last().map(|c| c.close).unwrap_or(current_price);
                    let stop = self.confluence.calculate_stop_loss(
                        entry,
                        conf.direction,
                        exec_scores,
                        &scoring,
                    );
                    let tps =
                        self.confluence
                            .calculate_take_profits(entry, conf.direction, stop, &scoring);
                    self.learning.open_shadow_trade(&conf, entry, stop, tps);
                }
            }
        }

        let summary = {
            let positions = self.positions.lock().await;
            positions.summary(current_price)
        };
        info!(
            cycle = self.cycle_count,
            price = current_price,
            open = summary.open_positions,
            total_pnl = %format!("${:+.2}", summary.total_pnl_usd),
            "Cycle complete"
        );
        Ok(())
    }

    fn build_scoring(&self) -> ScoringConfig {
        if self.config.bot.learning_enabled {
            ConfluenceEngine::scoring_config(&self.config, &self.learning)
        } else {
            let source = self.confluence.static_source(&self.config);
            ConfluenceEngine::scoring_config(&self.config, &source)
        }
    }

    /// Fetch candle series for all three roles; None aborts the cycle
    async fn fetch_candles(&self) -> Option<BTreeMap<TimeframeRole, Vec<Candle>>> {
        let labels = [
            (TimeframeRole::Execution, self.config.timeframes.execution.clone()),
            (
                TimeframeRole::Confirmation,
                self.config.timeframes.confirmation.clone(),
            ),
            (TimeframeRole::Trend, self.config.timeframes.trend.clone()),
        ];

        let mut map = BTreeMap::new();
        for (i, (role, label)) in labels.iter().enumerate() {
            if i > 0 {
                // Upstream rate limit (~30 req/min)
                sleep(Duration::from_secs(self.config.price_data.request_delay_secs)).await;
            }
            match self
                .candle_source
                .fetch_ohlcv(label, self.config.price_data.candle_limit)
                .await
            {
                Ok(series) if !series.is_empty() => {
                    map.insert(*role, series);
                }
                Ok(_) => warn!(%role, %label, "Empty candle series"),
                Err(e) => warn!(%role, %label, error = %e, "Candle fetch failed"),
            }
        }

        if map.is_empty() {
            warn!("No candle data this cycle");
            return None;
        }
        Some(map)
    }

    /// Feed realized outcomes back into weight adaptation
    fn handle_close_events(&mut self, events: &[CloseEvent]) {
        for event in events {
            let pnl_pct = event.position.pnl_pct;
            info!(
                id = %event.position.id,
                reason = %event.reason.label(),
                pnl = %format!("{pnl_pct:+.2}%"),
                tx = %event.tx_hash,
                "Position close event"
            );
            if let Some(signal) = self.open_signals.remove(&event.position.id) {
                let outcome = if pnl_pct > 0.0 {
                    TradeOutcome::Win
                } else {
                    TradeOutcome::Loss
                };
                self.confluence.record_result(&signal, outcome, pnl_pct);
            }
        }
    }

    /// Position summary snapshot for external reporting
    pub async fn summary(&self, current_price: f64) -> PositionsSummary {
        self.positions.lock().await.summary(current_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{SwapError, SwapQuote, SwapVenue};
    use async_trait::async_trait;

    /// Offline candle source with canned series
    struct StubCandles {
        candles: Vec<Candle>,
        price: f64,
        fail: bool,
    }

    #[async_trait]
    impl CandleSource for StubCandles {
        async fn fetch_ohlcv(&self, _timeframe: &str, _limit: usize) -> Result<Vec<Candle>> {
            if self.fail {
                anyhow::bail!("stub fetch failure");
            }
            Ok(self.candles.clone())
        }

        async fn current_price(&self) -> Result<f64> {
            if self.fail {
                anyhow::bail!("stub price failure");
            }
            Ok(self.price)
        }
    }

    struct NoopVenue;

    #[async_trait]
    impl SwapVenue for NoopVenue {
        async fn quote(
            &self,
            input_mint: &str,
            output_mint: &str,
            amount: u64,
            _slippage_bps: u16,
        ) -> Result<SwapQuote, SwapError> {
            Ok(SwapQuote {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                in_amount: amount,
                out_amount: amount,
                price_impact_pct: 0.0,
                raw: serde_json::json!({}),
            })
        }

        async fn execute(&self, _quote: &SwapQuote) -> Result<String, SwapError> {
            Ok("NOOP_TX".into())
        }
    }

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: 1_700_000_000 + i as i64 * 300,
                open: 100.0,
                high: 100.4,
                low: 99.6,
                close: 100.0 + (i as f64 * 0.731).sin(),
                volume: 1000.0,
            })
            .collect()
    }

    fn test_bot(dir: &Path, source: StubCandles) -> TradingBot {
        // The cycle hot-reloads config, so pin the fetch delay through the
        // environment as well
        std::env::set_var("SOLBOT__PRICE_DATA__REQUEST_DELAY_SECS", "0");
        let mut config = AppConfig::load().unwrap();
        config.persistence.data_dir = dir.to_string_lossy().into_owned();
        config.price_data.request_delay_secs = 0;
        TradingBot::new(config, Arc::new(source), Arc::new(NoopVenue)).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_records_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubCandles {
            candles: candles(120),
            price: 100.0,
            fail: false,
        };
        let mut bot = test_bot(dir.path(), source);
        bot.run_cycle().await.unwrap();
        assert_eq!(bot.learning().state.total_analyses, 1);
        assert!(dir.path().join("analysis_log.json").exists());
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubCandles {
            candles: Vec::new(),
            price: 100.0,
            fail: true,
        };
        let mut bot = test_bot(dir.path(), source);
        bot.run_cycle().await.unwrap();
        // Nothing recorded, nothing mutated
        assert_eq!(bot.learning().state.total_analyses, 0);
        assert_eq!(bot.positions.lock().await.open_count(), 0);
    }
}
