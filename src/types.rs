//! Core types used throughout SolBot
//!
//! Defines common data structures for candles, signals, directions, etc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Trade direction derived from confluence scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Some(Direction::Long),
            "short" | "sell" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// Role a timeframe plays in multi-timeframe confluence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeRole {
    /// Entry precision (e.g. 5m)
    Execution,
    /// Trend confirmation (e.g. 15m)
    Confirmation,
    /// Macro bias (e.g. 1h)
    Trend,
}

impl TimeframeRole {
    /// Weight applied when combining scores across timeframes
    pub fn weight(&self) -> f64 {
        match self {
            TimeframeRole::Execution => 0.40,
            TimeframeRole::Confirmation => 0.35,
            TimeframeRole::Trend => 0.25,
        }
    }

    pub const ALL: [TimeframeRole; 3] = [
        TimeframeRole::Execution,
        TimeframeRole::Confirmation,
        TimeframeRole::Trend,
    ];
}

impl fmt::Display for TimeframeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeframeRole::Execution => write!(f, "execution"),
            TimeframeRole::Confirmation => write!(f, "confirmation"),
            TimeframeRole::Trend => write!(f, "trend"),
        }
    }
}

/// Side of a directional indicator signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Buy,
    Sell,
}

impl SignalSide {
    /// Sign used when normalizing signal strength to [-1, 1]
    pub fn sign(&self) -> f64 {
        match self {
            SignalSide::Buy => 1.0,
            SignalSide::Sell => -1.0,
        }
    }
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSide::Buy => write!(f, "buy"),
            SignalSide::Sell => write!(f, "sell"),
        }
    }
}

/// Identity of each indicator channel feeding the confluence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    EmaAlignment,
    EmaCrossover,
    IchimokuTrend,
    IchimokuSignal,
    FibonacciSupport,
    FibonacciResistance,
    Rsi,
    Volume,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 8] = [
        IndicatorKind::EmaAlignment,
        IndicatorKind::EmaCrossover,
        IndicatorKind::IchimokuTrend,
        IndicatorKind::IchimokuSignal,
        IndicatorKind::FibonacciSupport,
        IndicatorKind::FibonacciResistance,
        IndicatorKind::Rsi,
        IndicatorKind::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::EmaAlignment => "ema_alignment",
            IndicatorKind::EmaCrossover => "ema_crossover",
            IndicatorKind::IchimokuTrend => "ichimoku_trend",
            IndicatorKind::IchimokuSignal => "ichimoku_signal",
            IndicatorKind::FibonacciSupport => "fibonacci_support",
            IndicatorKind::FibonacciResistance => "fibonacci_resistance",
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Volume => "volume",
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time (Unix seconds)
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Why `generate_signal` declined to emit a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    LowConfidence,
    FewIndicators,
    LowRiskReward,
    RsiFilter,
    VolumeFilter,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::LowConfidence => write!(f, "low_confidence"),
            RejectionReason::FewIndicators => write!(f, "few_indicators"),
            RejectionReason::LowRiskReward => write!(f, "low_rr"),
            RejectionReason::RsiFilter => write!(f, "rsi_filter"),
            RejectionReason::VolumeFilter => write!(f, "volume_filter"),
        }
    }
}

/// Outcome of a closed trade, fed back into weight adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "win"),
            TradeOutcome::Loss => write!(f, "loss"),
        }
    }
}

/// Fully-qualified trade signal emitted by the confluence engine
///
/// Immutable once created; consumed exactly once by the position opener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Sorted away from entry toward profit, at most 3 levels
    pub take_profits: Vec<f64>,
    /// Execution timeframe label (e.g. "5m")
    pub timeframe: String,
    /// Signed combined confluence score
    pub confluence_score: f64,
    pub risk_reward_ratio: f64,
    /// Combined per-indicator scores behind this signal
    pub indicators_detail: BTreeMap<IndicatorKind, f64>,
}
