//! Learning engine
//!
//! Records every analysis cycle, grades them retroactively against future
//! prices, runs "shadow" paper trades for grey-zone confidence, and nudges
//! the effective threshold, risk-per-trade, and indicator weights from the
//! observed outcomes. Exposes the adjusted parameters through the
//! [`WeightSource`] capability interface consumed by the confluence engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::confluence::{ConfluenceResult, WeightSource};
use crate::types::{Direction, IndicatorKind, RejectionReason};

const ANALYSIS_LOG_FILE: &str = "analysis_log.json";
const SHADOW_TRADES_FILE: &str = "shadow_trades.json";
const LEARNING_STATE_FILE: &str = "learning_state.json";
const DAILY_REPORTS_FILE: &str = "daily_reports.json";

/// Retention cap for the analysis log
const MAX_ANALYSIS_RECORDS: usize = 10_000;

/// A profitable move must clear this much to count as a hit
const PROFIT_THRESHOLD_PCT: f64 = 0.5;

/// Shadow trades time out after 4 hours
const SHADOW_TIMEOUT_SECS: i64 = 4 * 3600;

/// Maximum concurrently open shadow trades
const MAX_OPEN_SHADOWS: usize = 3;

/// One analysis cycle, with or without an emitted signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub timestamp: DateTime<Utc>,
    pub analysis_number: u64,
    pub price: f64,
    pub direction: Direction,
    pub confidence: f64,
    pub confluence_score: f64,
    pub agreeing_indicators: usize,
    pub total_indicators: usize,
    pub combined_scores: BTreeMap<IndicatorKind, f64>,
    pub rsi_value: f64,
    pub volume_ratio: f64,
    pub signal_generated: bool,
    pub rejection_reason: Option<RejectionReason>,
    // Future prices, filled retroactively as cycles pass
    pub price_after_5m: f64,
    pub price_after_15m: f64,
    pub price_after_30m: f64,
    pub price_after_1h: f64,
    pub would_have_profited: Option<bool>,
    pub potential_pnl_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowStatus {
    Open,
    WinTp1,
    WinTp2,
    WinTp3,
    LossSl,
    Timeout,
}

impl ShadowStatus {
    fn win_tp(level: usize) -> Self {
        match level {
            1 => ShadowStatus::WinTp1,
            2 => ShadowStatus::WinTp2,
            _ => ShadowStatus::WinTp3,
        }
    }
}

/// Virtual position opened purely for evaluation, never submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTrade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub confidence: f64,
    pub confluence_score: f64,
    pub indicators: BTreeMap<IndicatorKind, f64>,
    pub status: ShadowStatus,
    pub exit_price: f64,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_pct: f64,
    /// Best excursion in favor before close (%)
    pub max_favorable: f64,
    /// Worst excursion against before close (%)
    pub max_adverse: f64,
}

/// Adaptive state carried across sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningState {
    pub total_analyses: u64,
    pub total_shadow_trades: u64,
    pub shadow_wins: u64,
    pub shadow_losses: u64,
    /// Rejections that would have been profitable
    pub missed_opportunities: u64,
    /// Rejections that would have lost
    pub dodged_bullets: u64,
    pub last_daily_review: Option<String>,
    /// Risk multiplier: 1.0 normal, 0.3 floor, 2.0 cap
    pub current_risk_level: f64,
    /// Additive adjustment to the confluence threshold
    pub confidence_adjustment: f64,
    /// Directional accuracy per indicator, percent
    pub indicator_accuracy: BTreeMap<IndicatorKind, f64>,
    /// Positive for win streaks, negative for loss streaks
    pub streak: i64,
    pub max_streak: i64,
    pub days_learning: u64,
}

impl Default for LearningState {
    fn default() -> Self {
        Self {
            total_analyses: 0,
            total_shadow_trades: 0,
            shadow_wins: 0,
            shadow_losses: 0,
            missed_opportunities: 0,
            dodged_bullets: 0,
            last_daily_review: None,
            current_risk_level: 1.0,
            confidence_adjustment: 0.0,
            indicator_accuracy: BTreeMap::new(),
            streak: 0,
            max_streak: 0,
            days_learning: 0,
        }
    }
}

/// Daily review output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub date: String,
    pub total_analyses: usize,
    pub would_profit: usize,
    pub would_loss: usize,
    pub accuracy_pct: f64,
    pub signals_generated: usize,
    pub signals_correct: usize,
    pub missed_opportunities: usize,
    pub dodged_bullets: usize,
    pub shadow_trades: usize,
    pub shadow_win_rate_pct: f64,
    pub risk_level: f64,
    pub effective_threshold: f64,
    pub days_learning: u64,
}

pub struct LearningEngine {
    data_dir: PathBuf,
    analysis_log: Vec<AnalysisRecord>,
    shadow_trades: Vec<ShadowTrade>,
    daily_reports: Vec<DailyReport>,
    pub state: LearningState,
    // Base parameters refreshed from config each cycle
    base_threshold: f64,
    base_risk_per_trade: f64,
    base_weights: BTreeMap<IndicatorKind, f64>,
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed learning file, starting fresh");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                warn!(path = %path.display(), error = %e, "Failed to persist learning file");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize learning file"),
    }
}

impl LearningEngine {
    pub fn new(data_dir: &Path, config: &AppConfig) -> Self {
        let mut engine = Self {
            data_dir: data_dir.to_path_buf(),
            analysis_log: load_json(&data_dir.join(ANALYSIS_LOG_FILE)),
            shadow_trades: load_json(&data_dir.join(SHADOW_TRADES_FILE)),
            daily_reports: load_json(&data_dir.join(DAILY_REPORTS_FILE)),
            state: load_json(&data_dir.join(LEARNING_STATE_FILE)),
            base_threshold: config.confluence.threshold,
            base_risk_per_trade: config.risk.risk_per_trade,
            base_weights: BTreeMap::new(),
        };
        engine.update_base(config);
        engine
    }

    /// Refresh base parameters from the hot-reloaded configuration
    pub fn update_base(&mut self, config: &AppConfig) {
        self.base_threshold = config.confluence.threshold;
        self.base_risk_per_trade = config.risk.risk_per_trade;
        self.base_weights = config
            .confluence
            .weights
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
    }

    fn save_analysis_log(&mut self) {
        if self.analysis_log.len() > MAX_ANALYSIS_RECORDS {
            let excess = self.analysis_log.len() - MAX_ANALYSIS_RECORDS;
            self.analysis_log.drain(..excess);
        }
        save_json(&self.data_dir.join(ANALYSIS_LOG_FILE), &self.analysis_log);
    }

    fn save_shadow_trades(&self) {
        save_json(&self.data_dir.join(SHADOW_TRADES_FILE), &self.shadow_trades);
    }

    fn save_state(&self) {
        save_json(&self.data_dir.join(LEARNING_STATE_FILE), &self.state);
    }

    fn save_daily_reports(&self) {
        save_json(&self.data_dir.join(DAILY_REPORTS_FILE), &self.daily_reports);
    }

    // ── Analysis recording ──────────────────────────────────────

    /// Record one analysis cycle, signal or not
    pub fn record_analysis(
        &mut self,
        price: f64,
        conf: &ConfluenceResult,
        rsi_value: f64,
        volume_ratio: f64,
        signal_generated: bool,
        rejection_reason: Option<RejectionReason>,
    ) {
        self.state.total_analyses += 1;
        let record = AnalysisRecord {
            timestamp: Utc::now(),
            analysis_number: self.state.total_analyses,
            price,
            direction: conf.direction,
            confidence: conf.confidence,
            confluence_score: conf.confluence_score,
            agreeing_indicators: conf.agreeing_indicators,
            total_indicators: conf.combined_scores.len(),
            combined_scores: conf.combined_scores.clone(),
            rsi_value,
            volume_ratio,
            signal_generated,
            rejection_reason,
            price_after_5m: 0.0,
            price_after_15m: 0.0,
            price_after_30m: 0.0,
            price_after_1h: 0.0,
            would_have_profited: None,
            potential_pnl_pct: 0.0,
        };
        self.analysis_log.push(record);
        self.save_analysis_log();
        self.save_state();
    }

    /// Fill future prices of past analyses and grade the ones that have
    /// aged a full hour. Called every cycle.
    pub fn update_future_prices(&mut self, current_price: f64) {
        let now = Utc::now();
        let mut graded = 0usize;

        for record in &mut self.analysis_log {
            if record.would_have_profited.is_some() {
                continue;
            }
            let elapsed_min = (now - record.timestamp).num_seconds() as f64 / 60.0;

            if elapsed_min >= 5.0 && record.price_after_5m == 0.0 {
                record.price_after_5m = current_price;
            }
            if elapsed_min >= 15.0 && record.price_after_15m == 0.0 {
                record.price_after_15m = current_price;
            }
            if elapsed_min >= 30.0 && record.price_after_30m == 0.0 {
                record.price_after_30m = current_price;
            }
            if elapsed_min >= 60.0 && record.price_after_1h == 0.0 {
                record.price_after_1h = current_price;
                graded += 1;

                let entry = record.price;
                let futures = [
                    record.price_after_5m,
                    record.price_after_15m,
                    record.price_after_30m,
                    record.price_after_1h,
                ];
                let pnl = match record.direction {
                    Direction::Long => {
                        let best = futures.iter().cloned().fold(f64::MIN, f64::max);
                        (best - entry) / entry * 100.0
                    }
                    Direction::Short => {
                        let worst = futures.iter().cloned().fold(f64::MAX, f64::min);
                        (entry - worst) / entry * 100.0
                    }
                };
                record.potential_pnl_pct = pnl;
                let profited = pnl > PROFIT_THRESHOLD_PCT;
                record.would_have_profited = Some(profited);

                if !record.signal_generated {
                    if profited {
                        self.state.missed_opportunities += 1;
                    } else {
                        self.state.dodged_bullets += 1;
                    }
                }
            }
        }

        if graded > 0 {
            self.save_analysis_log();
            self.save_state();
            info!(graded, "Past analyses graded retroactively");
        }
    }

    // ── Shadow trades ───────────────────────────────────────────

    /// Open a shadow trade when confidence lands in the grey zone below the
    /// threshold, with at most 3 open at once.
    pub fn should_open_shadow_trade(&self, conf: &ConfluenceResult) -> bool {
        let threshold = self.effective_threshold();
        if !(0.25..1.0).contains(&conf.confidence) || conf.confidence >= threshold {
            return false;
        }
        let open = self
            .shadow_trades
            .iter()
            .filter(|t| t.status == ShadowStatus::Open)
            .count();
        open < MAX_OPEN_SHADOWS
    }

    /// Returns the new shadow trade's id
    pub fn open_shadow_trade(
        &mut self,
        conf: &ConfluenceResult,
        price: f64,
        stop_loss: f64,
        take_profits: Vec<f64>,
    ) -> String {
        self.state.total_shadow_trades += 1;
        let trade = ShadowTrade {
            id: format!("shadow_{}", self.state.total_shadow_trades),
            timestamp: Utc::now(),
            direction: conf.direction,
            entry_price: price,
            stop_loss,
            take_profits,
            confidence: conf.confidence,
            confluence_score: conf.confluence_score,
            indicators: conf.combined_scores.clone(),
            status: ShadowStatus::Open,
            exit_price: 0.0,
            exit_time: None,
            pnl_pct: 0.0,
            max_favorable: 0.0,
            max_adverse: 0.0,
        };
        info!(
            id = %trade.id,
            direction = %trade.direction,
            confidence = %format!("{:.0}%", trade.confidence * 100.0),
            "Shadow trade opened"
        );
        let id = trade.id.clone();
        self.shadow_trades.push(trade);
        self.save_shadow_trades();
        self.save_state();
        id
    }

    /// Walk open shadow trades against the current price; close on SL/TP or
    /// after the 4-hour timeout.
    pub fn update_shadow_trades(&mut self, current_price: f64) {
        let now = Utc::now();
        let mut wins = 0u64;
        let mut losses = 0u64;

        for trade in &mut self.shadow_trades {
            if trade.status != ShadowStatus::Open {
                continue;
            }
            let entry = trade.entry_price;
            let (favorable, adverse) = match trade.direction {
                Direction::Long => (
                    (current_price - entry) / entry * 100.0,
                    (entry - current_price) / entry * 100.0,
                ),
                Direction::Short => (
                    (entry - current_price) / entry * 100.0,
                    (current_price - entry) / entry * 100.0,
                ),
            };
            trade.max_favorable = trade.max_favorable.max(favorable);
            trade.max_adverse = trade.max_adverse.max(adverse);

            let stopped = match trade.direction {
                Direction::Long => current_price <= trade.stop_loss,
                Direction::Short => current_price >= trade.stop_loss,
            };
            if stopped {
                trade.status = ShadowStatus::LossSl;
                trade.exit_price = current_price;
                trade.exit_time = Some(now);
                trade.pnl_pct = favorable;
                losses += 1;
                info!(id = %trade.id, pnl = %format!("{:+.2}%", trade.pnl_pct), "Shadow trade stopped out");
                continue;
            }

            let mut hit = None;
            for (i, tp) in trade.take_profits.iter().enumerate() {
                let reached = match trade.direction {
                    Direction::Long => current_price >= *tp,
                    Direction::Short => current_price <= *tp,
                };
                if reached {
                    hit = Some(i + 1);
                    break;
                }
            }
            if let Some(level) = hit {
                trade.status = ShadowStatus::win_tp(level);
                trade.exit_price = current_price;
                trade.exit_time = Some(now);
                trade.pnl_pct = favorable;
                wins += 1;
                info!(id = %trade.id, level, pnl = %format!("{:+.2}%", trade.pnl_pct), "Shadow trade took profit");
                continue;
            }

            if (now - trade.timestamp).num_seconds() > SHADOW_TIMEOUT_SECS {
                trade.status = ShadowStatus::Timeout;
                trade.exit_price = current_price;
                trade.exit_time = Some(now);
                trade.pnl_pct = favorable;
                if trade.pnl_pct > 0.0 {
                    wins += 1;
                } else {
                    losses += 1;
                }
                info!(id = %trade.id, pnl = %format!("{:+.2}%", trade.pnl_pct), "Shadow trade timed out");
            }
        }

        for _ in 0..wins {
            self.update_streak(true);
        }
        for _ in 0..losses {
            self.update_streak(false);
        }
        self.state.shadow_wins += wins;
        self.state.shadow_losses += losses;

        if wins + losses > 0 {
            self.save_shadow_trades();
            self.save_state();
        }
    }

    fn update_streak(&mut self, won: bool) {
        self.state.streak = if won {
            self.state.streak.max(0) + 1
        } else {
            self.state.streak.min(0) - 1
        };
        self.state.max_streak = self.state.max_streak.max(self.state.streak.abs());
    }

    // ── Daily review ────────────────────────────────────────────

    /// Once a day: grade the last 24h, recompute indicator accuracy, and
    /// adjust risk level / confidence threshold. Returns None when already
    /// done today or without enough data.
    pub fn daily_review(&mut self) -> Option<DailyReport> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.state.last_daily_review.as_deref() == Some(today.as_str()) {
            return None;
        }

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let recent: Vec<&AnalysisRecord> = self
            .analysis_log
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .collect();
        if recent.len() < 10 {
            return None;
        }
        let evaluated: Vec<&AnalysisRecord> = recent
            .iter()
            .copied()
            .filter(|r| r.would_have_profited.is_some())
            .collect();
        if evaluated.is_empty() {
            return None;
        }

        let total = evaluated.len();
        let would_profit = evaluated
            .iter()
            .filter(|r| r.would_have_profited == Some(true))
            .count();
        let signaled: Vec<&&AnalysisRecord> =
            evaluated.iter().filter(|r| r.signal_generated).collect();
        let signals_correct = signaled
            .iter()
            .filter(|r| r.would_have_profited == Some(true))
            .count();
        let missed = evaluated
            .iter()
            .filter(|r| !r.signal_generated && r.would_have_profited == Some(true))
            .count();
        let dodged = evaluated
            .iter()
            .filter(|r| !r.signal_generated && r.would_have_profited == Some(false))
            .count();

        let indicator_accuracy = Self::indicator_accuracy(&evaluated);

        let closed_shadows: Vec<&ShadowTrade> = self
            .shadow_trades
            .iter()
            .filter(|t| t.status != ShadowStatus::Open)
            .collect();
        let shadow_total = closed_shadows.len();
        let shadow_wins = closed_shadows.iter().filter(|t| t.pnl_pct > 0.0).count();
        let shadow_wr = if shadow_total > 0 {
            shadow_wins as f64 / shadow_total as f64 * 100.0
        } else {
            0.0
        };

        // Risk level follows shadow performance: earn more risk by winning,
        // never below the 0.3 floor.
        if shadow_total >= 5 {
            let current = self.state.current_risk_level;
            self.state.current_risk_level = if shadow_wr >= 70.0 {
                (current * 1.10).min(2.0)
            } else if shadow_wr >= 55.0 {
                (current * 1.03).min(1.5)
            } else if shadow_wr >= 40.0 {
                (current * 0.95).max(0.5)
            } else {
                (current * 0.80).max(0.3)
            };
        }

        // Threshold drifts toward where the opportunities are
        if missed > dodged * 2 {
            let adj = (missed as f64 * 0.005).min(0.05);
            self.state.confidence_adjustment =
                (self.state.confidence_adjustment - adj).max(-0.20);
        } else if dodged > missed * 2 {
            let adj = (dodged as f64 * 0.003).min(0.03);
            self.state.confidence_adjustment =
                (self.state.confidence_adjustment + adj).min(0.15);
        }

        self.state.indicator_accuracy = indicator_accuracy;
        self.state.last_daily_review = Some(today.clone());
        self.state.days_learning += 1;

        let report = DailyReport {
            date: today,
            total_analyses: total,
            would_profit,
            would_loss: total - would_profit,
            accuracy_pct: would_profit as f64 / total as f64 * 100.0,
            signals_generated: signaled.len(),
            signals_correct,
            missed_opportunities: missed,
            dodged_bullets: dodged,
            shadow_trades: shadow_total,
            shadow_win_rate_pct: shadow_wr,
            risk_level: self.state.current_risk_level,
            effective_threshold: self.effective_threshold(),
            days_learning: self.state.days_learning,
        };

        self.daily_reports.push(report.clone());
        self.save_daily_reports();
        self.save_state();

        info!(
            accuracy = %format!("{:.0}%", report.accuracy_pct),
            missed = report.missed_opportunities,
            dodged = report.dodged_bullets,
            risk_level = %format!("{:.2}", report.risk_level),
            "Daily review complete"
        );
        Some(report)
    }

    /// Directional accuracy per indicator over graded analyses, percent
    fn indicator_accuracy(evaluated: &[&AnalysisRecord]) -> BTreeMap<IndicatorKind, f64> {
        struct Tally {
            correct: usize,
            wrong: usize,
        }
        let mut tallies: BTreeMap<IndicatorKind, Tally> = BTreeMap::new();

        for record in evaluated {
            let profited = record.would_have_profited == Some(true);
            for (kind, score) in &record.combined_scores {
                let says_long = *score > 0.1;
                let says_short = *score < -0.1;
                if !says_long && !says_short {
                    continue;
                }
                let tally = tallies.entry(*kind).or_insert(Tally {
                    correct: 0,
                    wrong: 0,
                });
                let agrees = match record.direction {
                    Direction::Long => says_long,
                    Direction::Short => says_short,
                };
                // Correct when it agreed on a profitable call, or opposed an
                // unprofitable one
                if agrees == profited {
                    tally.correct += 1;
                } else {
                    tally.wrong += 1;
                }
            }
        }

        tallies
            .into_iter()
            .filter(|(_, t)| t.correct + t.wrong > 0)
            .map(|(k, t)| {
                (
                    k,
                    t.correct as f64 / (t.correct + t.wrong) as f64 * 100.0,
                )
            })
            .collect()
    }

    /// Number of shadow trades still open
    pub fn open_shadow_count(&self) -> usize {
        self.shadow_trades
            .iter()
            .filter(|t| t.status == ShadowStatus::Open)
            .count()
    }
}

impl WeightSource for LearningEngine {
    /// Base threshold plus the learned adjustment, clamped to [0.20, 0.80]
    fn effective_threshold(&self) -> f64 {
        (self.base_threshold + self.state.confidence_adjustment).clamp(0.20, 0.80)
    }

    /// Base weights nudged by indicator accuracy, renormalized to sum 1
    fn effective_weights(&self) -> BTreeMap<IndicatorKind, f64> {
        let mut weights = self.base_weights.clone();
        for (kind, accuracy) in &self.state.indicator_accuracy {
            if let Some(weight) = weights.get_mut(kind) {
                if *accuracy >= 65.0 {
                    *weight = (*weight * 1.05).min(0.30);
                } else if *accuracy < 45.0 {
                    *weight = (*weight * 0.90).max(0.03);
                }
            }
        }
        let total: f64 = weights.values().sum();
        if total > 0.0 {
            for weight in weights.values_mut() {
                *weight /= total;
            }
        }
        weights
    }

    /// Base risk scaled by the earned risk level, hard-capped at 3%
    fn effective_risk_per_trade(&self) -> f64 {
        (self.base_risk_per_trade * self.state.current_risk_level).min(0.03)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeframeRole;

    fn test_engine(dir: &Path) -> (LearningEngine, AppConfig) {
        let config = AppConfig::load().unwrap();
        (LearningEngine::new(dir, &config), config)
    }

    fn conf_result(direction: Direction, confidence: f64) -> ConfluenceResult {
        let mut combined = BTreeMap::new();
        combined.insert(IndicatorKind::EmaAlignment, 0.6);
        combined.insert(IndicatorKind::Rsi, -0.2);
        ConfluenceResult {
            direction,
            confluence_score: if direction == Direction::Long {
                confidence
            } else {
                -confidence
            },
            confidence,
            agreeing_indicators: 3,
            combined_scores: combined,
            details: BTreeMap::<TimeframeRole, BTreeMap<IndicatorKind, f64>>::new(),
        }
    }

    #[test]
    fn test_shadow_trade_take_profit_and_streak() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());
        let conf = conf_result(Direction::Long, 0.35);
        engine.open_shadow_trade(&conf, 100.0, 98.0, vec![104.0, 106.0]);

        engine.update_shadow_trades(104.5);
        let trade = &engine.shadow_trades[0];
        assert_eq!(trade.status, ShadowStatus::WinTp1);
        assert!(trade.pnl_pct > 4.0);
        assert_eq!(engine.state.shadow_wins, 1);
        assert_eq!(engine.state.streak, 1);
    }

    #[test]
    fn test_shadow_trade_stop_loss() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());
        let conf = conf_result(Direction::Long, 0.35);
        engine.open_shadow_trade(&conf, 100.0, 98.0, vec![104.0]);

        engine.update_shadow_trades(97.5);
        let trade = &engine.shadow_trades[0];
        assert_eq!(trade.status, ShadowStatus::LossSl);
        assert!(trade.pnl_pct < 0.0);
        assert_eq!(engine.state.shadow_losses, 1);
        assert_eq!(engine.state.streak, -1);

        // Closed trades are not re-graded
        engine.update_shadow_trades(90.0);
        assert_eq!(engine.state.shadow_losses, 1);
    }

    #[test]
    fn test_short_shadow_trade_directions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());
        let conf = conf_result(Direction::Short, 0.35);
        engine.open_shadow_trade(&conf, 100.0, 102.0, vec![96.0]);

        // Price falls to the target: a short wins
        engine.update_shadow_trades(95.5);
        assert_eq!(engine.shadow_trades[0].status, ShadowStatus::WinTp1);
        assert!(engine.shadow_trades[0].pnl_pct > 4.0);
    }

    #[test]
    fn test_grey_zone_gating_and_open_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());

        // Inside the grey zone [0.25, threshold)
        assert!(engine.should_open_shadow_trade(&conf_result(Direction::Long, 0.30)));
        // Above threshold or below the floor: no shadow
        assert!(!engine.should_open_shadow_trade(&conf_result(Direction::Long, 0.60)));
        assert!(!engine.should_open_shadow_trade(&conf_result(Direction::Long, 0.20)));

        for _ in 0..3 {
            let conf = conf_result(Direction::Long, 0.30);
            engine.open_shadow_trade(&conf, 100.0, 98.0, vec![104.0]);
        }
        assert_eq!(engine.open_shadow_count(), 3);
        assert!(!engine.should_open_shadow_trade(&conf_result(Direction::Long, 0.30)));
    }

    #[test]
    fn test_effective_parameters_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());

        engine.state.confidence_adjustment = -0.50;
        assert_eq!(engine.effective_threshold(), 0.20);
        engine.state.confidence_adjustment = 0.50;
        assert_eq!(engine.effective_threshold(), 0.80);

        engine.state.current_risk_level = 10.0;
        assert_eq!(engine.effective_risk_per_trade(), 0.03);
        engine.state.current_risk_level = 0.5;
        assert!((engine.effective_risk_per_trade() - 0.0075).abs() < 1e-12);
    }

    #[test]
    fn test_effective_weights_follow_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, config) = test_engine(dir.path());
        engine
            .state
            .indicator_accuracy
            .insert(IndicatorKind::EmaAlignment, 80.0);
        engine
            .state
            .indicator_accuracy
            .insert(IndicatorKind::Rsi, 30.0);

        let weights = engine.effective_weights();
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);

        let base_ema = config.confluence.weights[&IndicatorKind::EmaAlignment];
        let base_rsi = config.confluence.weights[&IndicatorKind::Rsi];
        // Relative to bases: the accurate indicator gains, the poor one loses
        assert!(weights[&IndicatorKind::EmaAlignment] / base_ema > weights[&IndicatorKind::Rsi] / base_rsi);
    }

    #[test]
    fn test_retroactive_grading_counts_missed_opportunities() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());
        let conf = conf_result(Direction::Long, 0.40);
        engine.record_analysis(100.0, &conf, 50.0, 1.0, false, Some(RejectionReason::LowConfidence));

        // Age the record past the 1h grading mark
        engine.analysis_log[0].timestamp = Utc::now() - chrono::Duration::minutes(61);
        engine.update_future_prices(102.0);

        let record = &engine.analysis_log[0];
        assert_eq!(record.would_have_profited, Some(true));
        assert!((record.potential_pnl_pct - 2.0).abs() < 1e-9);
        assert_eq!(engine.state.missed_opportunities, 1);
        assert_eq!(engine.state.dodged_bullets, 0);
    }

    #[test]
    fn test_daily_review_adjusts_risk_and_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = test_engine(dir.path());

        // 12 graded rejections, all misses -> threshold drops
        for i in 0..12 {
            let conf = conf_result(Direction::Long, 0.30);
            engine.record_analysis(100.0 + i as f64, &conf, 50.0, 1.0, false, None);
        }
        for record in &mut engine.analysis_log {
            record.would_have_profited = Some(true);
            record.potential_pnl_pct = 1.5;
        }
        // 6 winning closed shadows -> risk level rises
        for _ in 0..6 {
            let conf = conf_result(Direction::Long, 0.30);
            engine.open_shadow_trade(&conf, 100.0, 98.0, vec![100.5]);
        }
        engine.update_shadow_trades(101.0);

        let report = engine.daily_review().expect("review should run");
        assert_eq!(report.missed_opportunities, 12);
        assert!(report.shadow_win_rate_pct > 99.0);
        assert!(engine.state.current_risk_level > 1.0);
        assert!(engine.state.confidence_adjustment < 0.0);

        // Second run on the same day is a no-op
        assert!(engine.daily_review().is_none());
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut engine, _) = test_engine(dir.path());
            let conf = conf_result(Direction::Long, 0.35);
            engine.open_shadow_trade(&conf, 100.0, 98.0, vec![104.0]);
            engine.state.current_risk_level = 1.3;
            engine.save_state();
        }
        let (engine, _) = test_engine(dir.path());
        assert_eq!(engine.shadow_trades.len(), 1);
        assert_eq!(engine.state.total_shadow_trades, 1);
        assert!((engine.state.current_risk_level - 1.3).abs() < 1e-9);
    }
}
