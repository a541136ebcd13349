//! Confluence engine
//!
//! Combines per-timeframe indicator scores into a weighted directional
//! signal, applies the rejection filters, and derives stop-loss /
//! take-profit levels. Scoring parameters travel in an explicit
//! [`ScoringConfig`] snapshot so the scoring functions are pure given
//! (scores, config); the mutable part — adapted indicator weights and the
//! trade history they are learned from — lives in the engine's store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, StopLossMode};
use crate::indicators::IndicatorScores;
use crate::types::{
    Candle, Direction, IndicatorKind, RejectionReason, TimeframeRole, TradeOutcome, TradeSignal,
};

/// Scoring parameters for one analysis cycle
///
/// Built fresh each cycle from the active [`WeightSource`], so live
/// reconfiguration and learned adjustments take effect without restarts.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub weights: BTreeMap<IndicatorKind, f64>,
    /// Minimum confidence to emit a signal
    pub threshold: f64,
    /// Minimum count of agreeing indicators
    pub min_agree: usize,
    pub min_risk_reward: f64,
    pub stop_loss_mode: StopLossMode,
    pub fixed_stop_loss_pct: f64,
    /// R:R multiples for the take-profit ladder
    pub take_profit_levels: Vec<f64>,
    /// Execution timeframe label stamped on emitted signals
    pub execution_timeframe: String,
}

/// Source of effective scoring parameters
///
/// The default implementation is plain configuration; an adaptive component
/// (learning engine) provides adjusted values through the same interface.
pub trait WeightSource: Send + Sync {
    fn effective_threshold(&self) -> f64;
    fn effective_weights(&self) -> BTreeMap<IndicatorKind, f64>;
    fn effective_risk_per_trade(&self) -> f64;
}

/// Static parameters straight from configuration plus the engine's own
/// adapted weight store.
pub struct StaticWeights {
    threshold: f64,
    weights: BTreeMap<IndicatorKind, f64>,
    risk_per_trade: f64,
}

impl StaticWeights {
    pub fn new(threshold: f64, weights: BTreeMap<IndicatorKind, f64>, risk_per_trade: f64) -> Self {
        Self {
            threshold,
            weights,
            risk_per_trade,
        }
    }
}

impl WeightSource for StaticWeights {
    fn effective_threshold(&self) -> f64 {
        self.threshold
    }

    fn effective_weights(&self) -> BTreeMap<IndicatorKind, f64> {
        self.weights.clone()
    }

    fn effective_risk_per_trade(&self) -> f64 {
        self.risk_per_trade
    }
}

/// Output of one confluence calculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceResult {
    pub direction: Direction,
    /// Signed weighted score
    pub confluence_score: f64,
    /// |score|, halved when too few indicators agree, capped at 1.0
    pub confidence: f64,
    pub agreeing_indicators: usize,
    pub combined_scores: BTreeMap<IndicatorKind, f64>,
    /// Normalized per-timeframe detail
    pub details: BTreeMap<TimeframeRole, BTreeMap<IndicatorKind, f64>>,
}

/// A closed trade appended to the history file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(flatten)]
    pub signal: TradeSignal,
    pub result: TradeOutcome,
    pub pnl_pct: f64,
}

/// Aggregate trade statistics for reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfluenceReport {
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate_pct: f64,
    pub total_pnl_pct: f64,
    pub avg_pnl_pct: f64,
}

const TRADE_HISTORY_FILE: &str = "trade_history.json";

/// Fallback weight for indicators missing from the weight map
const DEFAULT_INDICATOR_WEIGHT: f64 = 0.1;

pub struct ConfluenceEngine {
    history_path: PathBuf,
    trade_history: Vec<TradeRecord>,
    /// Adapted weights, learned from closed trades; the default static
    /// weight source when no learning component is wired in.
    weights: BTreeMap<IndicatorKind, f64>,
    last_rejection: Option<RejectionReason>,
}

impl ConfluenceEngine {
    /// Create an engine with the given starting weights, loading any
    /// previously persisted trade history from `data_dir`.
    pub fn new(data_dir: &Path, initial_weights: BTreeMap<IndicatorKind, f64>) -> Self {
        let history_path = data_dir.join(TRADE_HISTORY_FILE);
        let trade_history = Self::load_history(&history_path);
        Self {
            history_path,
            trade_history,
            weights: initial_weights,
            last_rejection: None,
        }
    }

    fn load_history(path: &Path) -> Vec<TradeRecord> {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(history) => history,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed trade history, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    /// Rewrite the full history file. Write failures are logged and the
    /// in-memory state wins until the next successful write.
    fn save_history(&self) {
        match serde_json::to_string_pretty(&self.trade_history) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.history_path, json) {
                    warn!(path = %self.history_path.display(), error = %e, "Failed to persist trade history");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize trade history"),
        }
    }

    /// Why the last `generate_signal` call emitted nothing
    pub fn last_rejection(&self) -> Option<RejectionReason> {
        self.last_rejection
    }

    /// The engine's current (possibly adapted) weights
    pub fn weights(&self) -> &BTreeMap<IndicatorKind, f64> {
        &self.weights
    }

    /// Default weight source: configured threshold/risk with the engine's
    /// own adapted weights.
    pub fn static_source(&self, config: &AppConfig) -> StaticWeights {
        StaticWeights::new(
            config.confluence.threshold,
            self.weights.clone(),
            config.risk.risk_per_trade,
        )
    }

    /// Build the per-cycle scoring snapshot from config + weight source
    pub fn scoring_config(config: &AppConfig, source: &dyn WeightSource) -> ScoringConfig {
        ScoringConfig {
            weights: source.effective_weights(),
            threshold: source.effective_threshold(),
            min_agree: config.confluence.min_indicators_agree,
            min_risk_reward: config.risk.min_risk_reward,
            stop_loss_mode: config.risk.stop_loss_mode,
            fixed_stop_loss_pct: config.risk.fixed_stop_loss_pct,
            take_profit_levels: config.risk.take_profit_levels.clone(),
            execution_timeframe: config.timeframes.execution.clone(),
        }
    }

    // ── Normalization ───────────────────────────────────────────

    /// Normalize one timeframe's indicator outputs to signed floats in
    /// roughly [-1, 1]. Fibonacci becomes two non-negative channels.
    fn normalize(scores: &IndicatorScores) -> BTreeMap<IndicatorKind, f64> {
        let mut n = BTreeMap::new();
        n.insert(IndicatorKind::EmaAlignment, scores.ema_alignment);

        let cx = &scores.ema_crossover;
        n.insert(
            IndicatorKind::EmaCrossover,
            cx.signal.map(|s| s.sign() * cx.strength).unwrap_or(0.0),
        );

        n.insert(IndicatorKind::IchimokuTrend, scores.ichimoku_trend);

        let isig = &scores.ichimoku_signal;
        n.insert(
            IndicatorKind::IchimokuSignal,
            isig.signal.map(|s| s.sign() * isig.strength).unwrap_or(0.0),
        );

        let fib = &scores.fibonacci;
        let fs = fib.support_score - fib.resistance_score;
        n.insert(IndicatorKind::FibonacciSupport, fs.max(0.0));
        n.insert(IndicatorKind::FibonacciResistance, (-fs).max(0.0));

        let rsi = &scores.rsi;
        n.insert(
            IndicatorKind::Rsi,
            rsi.signal.map(|s| s.sign() * rsi.strength).unwrap_or(0.0),
        );

        // Volume keeps its raw strength when no signal fired — the thin
        // volume penalty (-0.3) must flow through.
        let vol = &scores.volume;
        n.insert(
            IndicatorKind::Volume,
            vol.signal
                .map(|s| s.sign() * vol.strength)
                .unwrap_or(vol.strength),
        );

        n
    }

    // ── Multi-timeframe confluence ──────────────────────────────

    pub fn calculate_confluence(
        &self,
        scores_by_tf: &BTreeMap<TimeframeRole, IndicatorScores>,
        scoring: &ScoringConfig,
    ) -> ConfluenceResult {
        let mut combined: BTreeMap<IndicatorKind, f64> = BTreeMap::new();
        let mut details: BTreeMap<TimeframeRole, BTreeMap<IndicatorKind, f64>> = BTreeMap::new();

        for (role, scores) in scores_by_tf {
            let norm = Self::normalize(scores);
            let w = role.weight();
            for (kind, score) in &norm {
                *combined.entry(*kind).or_insert(0.0) += score * w;
            }
            details.insert(*role, norm);
        }

        let total_weight: f64 = scoring.weights.values().sum();
        if scoring.weights.is_empty() || total_weight <= 0.0 {
            // Malformed weight map from external config: neutral result
            warn!("Empty or non-positive indicator weight map, neutral confluence");
            return ConfluenceResult {
                direction: Direction::Short,
                confluence_score: 0.0,
                confidence: 0.0,
                agreeing_indicators: 0,
                combined_scores: combined,
                details,
            };
        }

        let mut final_score: f64 = combined
            .iter()
            .map(|(kind, score)| {
                score
                    * scoring
                        .weights
                        .get(kind)
                        .copied()
                        .unwrap_or(DEFAULT_INDICATOR_WEIGHT)
            })
            .sum();
        final_score /= total_weight;

        // Exactly zero resolves short — deliberate tie-break
        let direction = if final_score > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        let agreeing = combined
            .values()
            .filter(|s| match direction {
                Direction::Long => **s > 0.1,
                Direction::Short => **s < -0.1,
            })
            .count();

        let mut confidence = final_score.abs();
        if agreeing < scoring.min_agree {
            confidence *= 0.5;
        }

        ConfluenceResult {
            direction,
            confluence_score: final_score,
            confidence: confidence.min(1.0),
            agreeing_indicators: agreeing,
            combined_scores: combined,
            details,
        }
    }

    // ── Stop loss ───────────────────────────────────────────────

    fn fixed_stop(price: f64, direction: Direction, pct: f64) -> f64 {
        match direction {
            Direction::Long => price * (1.0 - pct),
            Direction::Short => price * (1.0 + pct),
        }
    }

    /// Collect candidate stops from kumo / kijun / fibonacci / 2×ATR and
    /// pick the tightest one still on the protective side of price.
    pub fn calculate_stop_loss(
        &self,
        price: f64,
        direction: Direction,
        exec_scores: &IndicatorScores,
        scoring: &ScoringConfig,
    ) -> f64 {
        if scoring.stop_loss_mode == StopLossMode::Fixed {
            return Self::fixed_stop(price, direction, scoring.fixed_stop_loss_pct);
        }

        let mut candidates: Vec<f64> = Vec::new();
        let lines = &exec_scores.ichimoku_lines;

        if let (Some(bottom), Some(top)) = (lines.kumo_bottom, lines.kumo_top) {
            candidates.push(match direction {
                Direction::Long => bottom * 0.998,
                Direction::Short => top * 1.002,
            });
        }

        if let Some(kijun) = lines.kijun {
            candidates.push(match direction {
                Direction::Long => kijun * 0.995,
                Direction::Short => kijun * 1.005,
            });
        }

        let mut level_prices: Vec<f64> = exec_scores.fibonacci.levels.iter().map(|l| l.price).collect();
        level_prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        match direction {
            Direction::Long => {
                if let Some(below) = level_prices.iter().rev().find(|p| **p < price) {
                    candidates.push(below * 0.998);
                }
            }
            Direction::Short => {
                if let Some(above) = level_prices.iter().find(|p| **p > price) {
                    candidates.push(above * 1.002);
                }
            }
        }

        if let Some(atr) = exec_scores.atr {
            candidates.push(match direction {
                Direction::Long => price - 2.0 * atr,
                Direction::Short => price + 2.0 * atr,
            });
        }

        if candidates.is_empty() {
            return Self::fixed_stop(price, direction, scoring.fixed_stop_loss_pct);
        }

        match direction {
            // Closest below price = tightest stop
            Direction::Long => candidates.iter().cloned().fold(f64::MIN, f64::max),
            Direction::Short => candidates.iter().cloned().fold(f64::MAX, f64::min),
        }
    }

    // ── Take profits ────────────────────────────────────────────

    /// Targets at `entry ± risk * multiple * 2` — the x2 is deliberate and
    /// the risk/reward filter depends on it. Deduplicated, sorted toward
    /// profit, truncated to 3.
    pub fn calculate_take_profits(
        &self,
        price: f64,
        direction: Direction,
        stop_loss: f64,
        scoring: &ScoringConfig,
    ) -> Vec<f64> {
        let risk = (price - stop_loss).abs();
        let mut tps: Vec<f64> = scoring
            .take_profit_levels
            .iter()
            .map(|ext| match direction {
                Direction::Long => price + risk * ext * 2.0,
                Direction::Short => price - risk * ext * 2.0,
            })
            .collect();

        match direction {
            Direction::Long => {
                tps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            }
            Direction::Short => {
                tps.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal))
            }
        }
        tps.dedup();
        tps.truncate(3);
        tps
    }

    // ── Signal generation ───────────────────────────────────────

    /// Run the full filter chain and emit a trade signal, or record the
    /// first rejection reason and return None.
    pub fn generate_signal(
        &mut self,
        symbol: &str,
        scores_by_tf: &BTreeMap<TimeframeRole, IndicatorScores>,
        exec_candles: &[Candle],
        scoring: &ScoringConfig,
    ) -> Option<TradeSignal> {
        self.last_rejection = None;
        let conf = self.calculate_confluence(scores_by_tf, scoring);

        if conf.confidence < scoring.threshold {
            self.last_rejection = Some(RejectionReason::LowConfidence);
            debug!(
                confidence = conf.confidence,
                threshold = scoring.threshold,
                "Signal rejected: low confidence"
            );
            return None;
        }
        if conf.agreeing_indicators < scoring.min_agree {
            self.last_rejection = Some(RejectionReason::FewIndicators);
            debug!(
                agreeing = conf.agreeing_indicators,
                min = scoring.min_agree,
                "Signal rejected: few agreeing indicators"
            );
            return None;
        }

        let price = match exec_candles.last() {
            Some(c) if c.close > 0.0 => c.close,
            _ => {
                warn!("No execution candles available, skipping signal");
                return None;
            }
        };
        let direction = conf.direction;

        let default_scores = IndicatorScores::default();
        let exec_scores = scores_by_tf
            .get(&TimeframeRole::Execution)
            .unwrap_or(&default_scores);

        let stop_loss = self.calculate_stop_loss(price, direction, exec_scores, scoring);
        let take_profits = self.calculate_take_profits(price, direction, stop_loss, scoring);

        let risk = (price - stop_loss).abs();
        let reward = take_profits
            .first()
            .map(|tp| (tp - price).abs())
            .unwrap_or(risk);
        let risk_reward_ratio = if risk > 0.0 { reward / risk } else { 0.0 };

        if risk_reward_ratio < scoring.min_risk_reward {
            self.last_rejection = Some(RejectionReason::LowRiskReward);
            debug!(rr = risk_reward_ratio, "Signal rejected: low risk/reward");
            return None;
        }

        // Never buy overbought / sell oversold
        let rsi_value = exec_scores.rsi.value;
        if (direction == Direction::Long && rsi_value > 70.0)
            || (direction == Direction::Short && rsi_value < 30.0)
        {
            self.last_rejection = Some(RejectionReason::RsiFilter);
            debug!(rsi = rsi_value, %direction, "Signal rejected: RSI filter");
            return None;
        }

        // Thin volume is an untrustworthy move
        if exec_scores.volume.ratio < 0.5 {
            self.last_rejection = Some(RejectionReason::VolumeFilter);
            debug!(ratio = exec_scores.volume.ratio, "Signal rejected: volume filter");
            return None;
        }

        Some(TradeSignal {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            direction,
            confidence: conf.confidence,
            entry_price: price,
            stop_loss,
            take_profits,
            timeframe: scoring.execution_timeframe.clone(),
            confluence_score: conf.confluence_score,
            risk_reward_ratio,
            indicators_detail: conf.combined_scores,
        })
    }

    // ── Result recording & adaptation ───────────────────────────

    /// Append a closed trade and adapt weights from recent accuracy
    pub fn record_result(&mut self, signal: &TradeSignal, result: TradeOutcome, pnl_pct: f64) {
        self.trade_history.push(TradeRecord {
            signal: signal.clone(),
            result,
            pnl_pct,
        });
        self.save_history();
        self.adapt_weights();
        info!(
            %result,
            pnl_pct = %format!("{pnl_pct:+.2}"),
            trades = self.trade_history.len(),
            "Trade result recorded"
        );
    }

    /// Blend each indicator's weight toward its directional accuracy over
    /// the last 50 trades: w = clamp(0.8*w + 0.2*acc, 0.05, 0.40), then
    /// renormalize to sum 1. Needs at least 10 recorded trades.
    fn adapt_weights(&mut self) {
        if self.trade_history.len() < 10 {
            return;
        }
        let recent = &self.trade_history[self.trade_history.len().saturating_sub(50)..];

        struct Perf {
            correct: usize,
            total: usize,
        }
        let mut perf: BTreeMap<IndicatorKind, Perf> = BTreeMap::new();

        for record in recent {
            for (kind, score) in &record.signal.indicators_detail {
                let entry = perf.entry(*kind).or_insert(Perf {
                    correct: 0,
                    total: 0,
                });
                entry.total += 1;
                if record.result == TradeOutcome::Win {
                    let agreed = match record.signal.direction {
                        Direction::Long => *score > 0.0,
                        Direction::Short => *score < 0.0,
                    };
                    if agreed {
                        entry.correct += 1;
                    }
                }
            }
        }

        for (kind, p) in &perf {
            if p.total == 0 {
                continue;
            }
            if let Some(weight) = self.weights.get_mut(kind) {
                let accuracy = p.correct as f64 / p.total as f64;
                *weight = (*weight * 0.8 + accuracy * 0.2).clamp(0.05, 0.40);
            }
        }

        let total: f64 = self.weights.values().sum();
        if total > 0.0 {
            for weight in self.weights.values_mut() {
                *weight /= total;
            }
        }
    }

    /// Aggregate statistics over the recorded trade history
    pub fn get_report(&self) -> ConfluenceReport {
        let total = self.trade_history.len();
        if total == 0 {
            return ConfluenceReport::default();
        }
        let wins = self
            .trade_history
            .iter()
            .filter(|t| t.result == TradeOutcome::Win)
            .count();
        let pnls: Vec<f64> = self.trade_history.iter().map(|t| t.pnl_pct).collect();
        let total_pnl: f64 = pnls.iter().sum();
        ConfluenceReport {
            total,
            wins,
            losses: total - wins,
            win_rate_pct: wins as f64 / total as f64 * 100.0,
            total_pnl_pct: total_pnl,
            avg_pnl_pct: total_pnl / total as f64,
        }
    }

    /// Number of recorded trades (for reporting)
    pub fn trade_count(&self) -> usize {
        self.trade_history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::indicators::{CrossoverSignal, RsiSignal, VolumeSignal};
    use crate::types::SignalSide;

    fn test_config() -> AppConfig {
        AppConfig::load().unwrap()
    }

    fn default_weights() -> BTreeMap<IndicatorKind, f64> {
        test_config()
            .confluence
            .weights
            .into_iter()
            .collect()
    }

    fn engine(dir: &Path) -> ConfluenceEngine {
        ConfluenceEngine::new(dir, default_weights())
    }

    fn scoring(config: &AppConfig, weights: BTreeMap<IndicatorKind, f64>) -> ScoringConfig {
        let source = StaticWeights::new(
            config.confluence.threshold,
            weights,
            config.risk.risk_per_trade,
        );
        ConfluenceEngine::scoring_config(config, &source)
    }

    fn flat_candles(n: usize, close: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: 1_700_000_000 + i as i64 * 300,
                open: close,
                high: close + 0.1,
                low: close - 0.1,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    /// Scores where a chosen set of channels is bullish at full strength
    fn bullish_scores(rsi_value: f64, volume_ratio: f64) -> IndicatorScores {
        IndicatorScores {
            ema_alignment: 1.0,
            ema_crossover: CrossoverSignal {
                signal: Some(SignalSide::Buy),
                strength: 1.0,
            },
            ichimoku_trend: 1.0,
            ichimoku_signal: crate::indicators::IchimokuSignal {
                signal: Some(SignalSide::Buy),
                strength: 1.0,
                event: None,
            },
            fibonacci: crate::indicators::FibonacciScore {
                support_score: 1.0,
                ..Default::default()
            },
            rsi: RsiSignal {
                signal: None,
                strength: 0.0,
                value: rsi_value,
            },
            volume: VolumeSignal {
                signal: None,
                strength: 0.0,
                ratio: volume_ratio,
            },
            ..Default::default()
        }
    }

    fn all_roles(scores: IndicatorScores) -> BTreeMap<TimeframeRole, IndicatorScores> {
        TimeframeRole::ALL
            .iter()
            .map(|r| (*r, scores.clone()))
            .collect()
    }

    #[test]
    fn test_normalize_splits_fibonacci_and_keeps_volume_penalty() {
        let mut scores = IndicatorScores::default();
        scores.fibonacci.support_score = 0.8;
        scores.fibonacci.resistance_score = 0.3;
        scores.volume = VolumeSignal {
            signal: None,
            strength: -0.3,
            ratio: 0.4,
        };
        let n = ConfluenceEngine::normalize(&scores);
        assert!((n[&IndicatorKind::FibonacciSupport] - 0.5).abs() < 1e-9);
        assert_eq!(n[&IndicatorKind::FibonacciResistance], 0.0);
        assert_eq!(n[&IndicatorKind::Volume], -0.3);
    }

    #[test]
    fn test_zero_score_resolves_short() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());
        let result = eng.calculate_confluence(&all_roles(IndicatorScores::default()), &sc);
        assert_eq!(result.confluence_score, 0.0);
        assert_eq!(result.direction, Direction::Short);
    }

    #[test]
    fn test_confidence_halved_when_few_indicators_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path());
        let config = test_config();

        // Only two channels active at 0.52 across all roles -> raw score
        // 0.52, agreeing = 2 < min_agree 3 -> confidence 0.26.
        let mut weights = BTreeMap::new();
        weights.insert(IndicatorKind::EmaAlignment, 0.5);
        weights.insert(IndicatorKind::IchimokuTrend, 0.5);
        let sc = scoring(&config, weights);

        let mut scores = IndicatorScores::default();
        scores.ema_alignment = 0.52;
        scores.ichimoku_trend = 0.52;
        let by_tf = all_roles(scores);

        let result = eng.calculate_confluence(&by_tf, &sc);
        assert_eq!(result.direction, Direction::Long);
        assert!((result.confluence_score - 0.52).abs() < 1e-9);
        assert_eq!(result.agreeing_indicators, 2);
        assert!((result.confidence - 0.26).abs() < 1e-9);

        // Raw confidence alone would pass the 0.50 threshold; the halved
        // value must not.
        let candles = flat_candles(30, 100.0);
        let signal = eng.generate_signal("SOL/USDC", &by_tf, &candles, &sc);
        assert!(signal.is_none());
        assert_eq!(eng.last_rejection(), Some(RejectionReason::LowConfidence));
    }

    #[test]
    fn test_empty_weight_map_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, BTreeMap::new());
        let result = eng.calculate_confluence(&all_roles(bullish_scores(50.0, 1.0)), &sc);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.confluence_score, 0.0);
    }

    #[test]
    fn test_take_profit_ladder_long_and_short() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());

        // entry 100, SL 98 (risk 2), multiples [1.0, 1.5, 2.0] ->
        // 100 + 2*mult*2 = [104, 106, 108]
        let tps = eng.calculate_take_profits(100.0, Direction::Long, 98.0, &sc);
        assert_eq!(tps, vec![104.0, 106.0, 108.0]);

        let tps = eng.calculate_take_profits(100.0, Direction::Short, 102.0, &sc);
        assert_eq!(tps, vec![96.0, 94.0, 92.0]);
    }

    #[test]
    fn test_take_profits_deduped_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let mut sc = scoring(&config, default_weights());
        sc.take_profit_levels = vec![1.0, 1.0, 1.5, 2.0, 3.0];
        let tps = eng.calculate_take_profits(100.0, Direction::Long, 98.0, &sc);
        assert_eq!(tps.len(), 3);
        assert_eq!(tps, vec![104.0, 106.0, 108.0]);
        // Sorted ascending for long
        assert!(tps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stop_loss_fixed_and_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let mut sc = scoring(&config, default_weights());

        sc.stop_loss_mode = StopLossMode::Fixed;
        sc.fixed_stop_loss_pct = 0.02;
        let sl = eng.calculate_stop_loss(100.0, Direction::Long, &IndicatorScores::default(), &sc);
        assert!((sl - 98.0).abs() < 1e-9);
        let sl = eng.calculate_stop_loss(100.0, Direction::Short, &IndicatorScores::default(), &sc);
        assert!((sl - 102.0).abs() < 1e-9);

        // Dynamic: tightest candidate below price wins for longs
        sc.stop_loss_mode = StopLossMode::Dynamic;
        let mut scores = IndicatorScores::default();
        scores.ichimoku_lines.kumo_bottom = Some(97.0);
        scores.ichimoku_lines.kumo_top = Some(99.0);
        scores.ichimoku_lines.kijun = Some(96.0);
        scores.fibonacci.levels = vec![
            crate::indicators::FibLevel {
                ratio: 0.5,
                price: 98.5,
            },
            crate::indicators::FibLevel {
                ratio: 0.382,
                price: 101.5,
            },
        ];
        scores.atr = Some(1.0);
        let sl = eng.calculate_stop_loss(100.0, Direction::Long, &scores, &sc);
        // candidates: 97*0.998=96.806, 96*0.995=95.52, 98.5*0.998=98.3017, 98.0
        assert!((sl - 98.5 * 0.998).abs() < 1e-9);

        // Short picks the tightest candidate above price
        let sl = eng.calculate_stop_loss(100.0, Direction::Short, &scores, &sc);
        // candidates: 99*1.002=99.198 (below price but still a candidate),
        // 96*1.005, 101.5*1.002=101.703, 102.0 -> min = 96*1.005
        assert!((sl - 96.0 * 1.005).abs() < 1e-9);
    }

    #[test]
    fn test_dynamic_stop_falls_back_to_fixed_without_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());
        let sl = eng.calculate_stop_loss(100.0, Direction::Long, &IndicatorScores::default(), &sc);
        assert!((sl - 100.0 * (1.0 - sc.fixed_stop_loss_pct)).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_filter_rejects_overbought_long() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());

        // Strong bullish confluence but execution RSI at 75
        let by_tf = all_roles(bullish_scores(75.0, 1.0));
        let candles = flat_candles(30, 100.0);

        let signal = eng.generate_signal("SOL/USDC", &by_tf, &candles, &sc);
        assert!(signal.is_none());
        assert_eq!(eng.last_rejection(), Some(RejectionReason::RsiFilter));

        // Idempotent: identical inputs give the identical rejection
        let signal = eng.generate_signal("SOL/USDC", &by_tf, &candles, &sc);
        assert!(signal.is_none());
        assert_eq!(eng.last_rejection(), Some(RejectionReason::RsiFilter));
    }

    #[test]
    fn test_volume_filter_rejects_thin_market() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());

        let by_tf = all_roles(bullish_scores(50.0, 0.4));
        let candles = flat_candles(30, 100.0);
        let signal = eng.generate_signal("SOL/USDC", &by_tf, &candles, &sc);
        assert!(signal.is_none());
        assert_eq!(eng.last_rejection(), Some(RejectionReason::VolumeFilter));
    }

    #[test]
    fn test_signal_emitted_with_clean_filters() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path());
        let config = test_config();
        let sc = scoring(&config, default_weights());

        let by_tf = all_roles(bullish_scores(50.0, 1.0));
        let candles = flat_candles(30, 100.0);
        let signal = eng
            .generate_signal("SOL/USDC", &by_tf, &candles, &sc)
            .expect("signal should fire");

        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, 100.0);
        assert!(signal.confidence >= sc.threshold);
        assert!(signal.risk_reward_ratio >= sc.min_risk_reward);
        assert_eq!(signal.timeframe, "5m");
        assert!(signal.take_profits.len() <= 3);
        assert!(signal.take_profits.windows(2).all(|w| w[0] < w[1]));
        assert!(signal.stop_loss < signal.entry_price);
        assert!(eng.last_rejection().is_none());
    }

    #[test]
    fn test_weight_adaptation_rewards_accurate_indicators() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path());
        let initial_ema = eng.weights()[&IndicatorKind::EmaAlignment];

        // 12 winning long trades where ema_alignment agreed and rsi opposed
        for i in 0..12 {
            let mut detail = BTreeMap::new();
            detail.insert(IndicatorKind::EmaAlignment, 0.8);
            detail.insert(IndicatorKind::Rsi, -0.4);
            let signal = TradeSignal {
                timestamp: Utc::now(),
                symbol: "SOL/USDC".into(),
                direction: Direction::Long,
                confidence: 0.6,
                entry_price: 100.0 + i as f64,
                stop_loss: 98.0,
                take_profits: vec![104.0],
                timeframe: "5m".into(),
                confluence_score: 0.6,
                risk_reward_ratio: 2.0,
                indicators_detail: detail,
            };
            eng.record_result(&signal, TradeOutcome::Win, 2.0);
        }

        let weights = eng.weights();
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9, "weights must stay normalized");
        assert!(
            weights[&IndicatorKind::EmaAlignment] > weights[&IndicatorKind::Rsi],
            "accurate indicator must outweigh the inaccurate one"
        );
        assert!(weights[&IndicatorKind::EmaAlignment] > initial_ema);
    }

    #[test]
    fn test_history_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut eng = engine(dir.path());
            let signal = TradeSignal {
                timestamp: Utc::now(),
                symbol: "SOL/USDC".into(),
                direction: Direction::Long,
                confidence: 0.6,
                entry_price: 100.0,
                stop_loss: 98.0,
                take_profits: vec![104.0, 106.0],
                timeframe: "5m".into(),
                confluence_score: 0.6,
                risk_reward_ratio: 2.0,
                indicators_detail: BTreeMap::new(),
            };
            eng.record_result(&signal, TradeOutcome::Win, 2.5);
        }
        let eng = engine(dir.path());
        assert_eq!(eng.trade_count(), 1);
        let report = eng.get_report();
        assert_eq!(report.total, 1);
        assert_eq!(report.wins, 1);
        assert!((report.total_pnl_pct - 2.5).abs() < 1e-9);
    }
}
