//! Technical indicator set for confluence scoring
//!
//! Computes EMA alignment/crossover, Ichimoku, Fibonacci levels, RSI, ATR
//! and volume ratio from a candle window. Everything here is a pure function
//! of the input slice — no I/O, no retained state. Indicators that lack
//! enough data report neutral/zero-strength results instead of erroring, and
//! callers tolerate partial scores.

use serde::{Deserialize, Serialize};

use crate::config::IndicatorsConfig;
use crate::types::{Candle, SignalSide};

/// EMA crossover event between the short and long EMA
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CrossoverSignal {
    pub signal: Option<SignalSide>,
    /// Separation of the EMAs at the cross, in [0, 1]
    pub strength: f64,
}

/// Which Ichimoku event produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IchimokuEvent {
    TkCross,
    KumoBreakout,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IchimokuSignal {
    pub signal: Option<SignalSide>,
    pub strength: f64,
    pub event: Option<IchimokuEvent>,
}

/// Ichimoku line values at the last bar, kept for stop-loss derivation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IchimokuLines {
    pub tenkan: Option<f64>,
    pub kijun: Option<f64>,
    pub senkou_a: Option<f64>,
    pub senkou_b: Option<f64>,
    pub kumo_top: Option<f64>,
    pub kumo_bottom: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RsiSignal {
    pub signal: Option<SignalSide>,
    pub strength: f64,
    /// Raw RSI value in [0, 100]; reported even when signal is none
    pub value: f64,
}

impl Default for RsiSignal {
    fn default() -> Self {
        Self {
            signal: None,
            strength: 0.0,
            value: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeSignal {
    pub signal: Option<SignalSide>,
    /// May be negative (-0.3) on thin volume
    pub strength: f64,
    /// Last volume over its rolling mean
    pub ratio: f64,
}

impl Default for VolumeSignal {
    fn default() -> Self {
        Self {
            signal: None,
            strength: 0.0,
            ratio: 1.0,
        }
    }
}

/// Swing direction used to anchor Fibonacci levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingDirection {
    Up,
    Down,
}

/// One Fibonacci level: retracement/extension ratio and its price
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FibLevel {
    pub ratio: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FibonacciScore {
    pub support_score: f64,
    pub resistance_score: f64,
    pub levels: Vec<FibLevel>,
    pub nearest: Option<FibLevel>,
    pub direction: Option<SwingDirection>,
}

/// All indicator outputs for one candle window
///
/// Recomputed fresh every analysis cycle; never mutated in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorScores {
    /// Stacked-EMA ordering score in [-1, 1]
    pub ema_alignment: f64,
    pub ema_crossover: CrossoverSignal,
    /// Ichimoku trend score in [-1, 1]
    pub ichimoku_trend: f64,
    pub ichimoku_signal: IchimokuSignal,
    pub ichimoku_lines: IchimokuLines,
    pub fibonacci: FibonacciScore,
    pub rsi: RsiSignal,
    pub volume: VolumeSignal,
    pub atr: Option<f64>,
    /// ATR as a percentage of price
    pub atr_pct: Option<f64>,
}

/// Indicator engine: configured periods, pure computation
pub struct IndicatorSet {
    config: IndicatorsConfig,
}

impl IndicatorSet {
    pub fn new(config: IndicatorsConfig) -> Self {
        Self { config }
    }

    /// Replace the configured periods (hot-reload path)
    pub fn update_config(&mut self, config: IndicatorsConfig) {
        self.config = config;
    }

    /// Compute every indicator for one candle window
    pub fn get_all_scores(&self, candles: &[Candle]) -> IndicatorScores {
        if candles.is_empty() {
            return IndicatorScores::default();
        }

        let last = candles.len() - 1;
        let atr = self.atr(candles);
        let atr_pct = match (atr, candles[last].close) {
            (Some(a), c) if c > 0.0 => Some(a / c * 100.0),
            _ => None,
        };

        IndicatorScores {
            ema_alignment: self.ema_alignment_score(candles),
            ema_crossover: self.ema_crossover_signal(candles),
            ichimoku_trend: self.ichimoku_trend_score(candles),
            ichimoku_signal: self.ichimoku_signal(candles),
            ichimoku_lines: self.ichimoku_lines_at(candles, last),
            fibonacci: self.fibonacci_score(candles),
            rsi: self.rsi_signal(candles),
            volume: self.volume_signal(candles),
            atr,
            atr_pct,
        }
    }

    // ── EMA ─────────────────────────────────────────────────────

    /// EMA over candles[..=end], seeded at the first close
    fn ema_at(candles: &[Candle], period: usize, end: usize) -> Option<f64> {
        if end + 1 < period || candles.is_empty() {
            return None;
        }
        let multiplier = 2.0 / (period as f64 + 1.0);
        let mut ema = candles[0].close;
        for c in candles.iter().take(end + 1).skip(1) {
            ema = (c.close - ema) * multiplier + ema;
        }
        Some(ema)
    }

    /// Score in [-1, 1]: +1 when every shorter EMA sits above every longer
    /// one at the last bar, -1 for the fully inverted ordering.
    pub fn ema_alignment_score(&self, candles: &[Candle]) -> f64 {
        if candles.is_empty() {
            return 0.0;
        }
        let last = candles.len() - 1;
        let mut periods = self.config.ema_periods.clone();
        periods.sort_unstable();

        let emas: Vec<Option<f64>> = periods
            .iter()
            .map(|&p| Self::ema_at(candles, p, last))
            .collect();

        let mut bullish_pairs = 0usize;
        let mut total_pairs = 0usize;
        for i in 0..emas.len() {
            for j in (i + 1)..emas.len() {
                if let (Some(short), Some(long)) = (emas[i], emas[j]) {
                    total_pairs += 1;
                    if short > long {
                        bullish_pairs += 1;
                    }
                }
            }
        }

        if total_pairs == 0 {
            return 0.0;
        }
        (2.0 * bullish_pairs as f64 / total_pairs as f64) - 1.0
    }

    /// Short/long EMA cross between the last two bars
    pub fn ema_crossover_signal(&self, candles: &[Candle]) -> CrossoverSignal {
        if candles.len() < 3 {
            return CrossoverSignal::default();
        }
        let last = candles.len() - 1;
        let (short, long) = (self.config.ema_cross_short, self.config.ema_cross_long);

        let (curr_s, curr_l, prev_s, prev_l) = match (
            Self::ema_at(candles, short, last),
            Self::ema_at(candles, long, last),
            Self::ema_at(candles, short, last - 1),
            Self::ema_at(candles, long, last - 1),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return CrossoverSignal::default(),
        };

        if curr_l == 0.0 {
            return CrossoverSignal::default();
        }
        let strength = ((curr_s - curr_l).abs() / curr_l * 100.0).min(1.0);

        if prev_s <= prev_l && curr_s > curr_l {
            CrossoverSignal {
                signal: Some(SignalSide::Buy),
                strength,
            }
        } else if prev_s >= prev_l && curr_s < curr_l {
            CrossoverSignal {
                signal: Some(SignalSide::Sell),
                strength,
            }
        } else {
            CrossoverSignal::default()
        }
    }

    // ── Ichimoku ────────────────────────────────────────────────

    /// Highest high over the window of `len` bars ending at `end`
    fn window_high(candles: &[Candle], end: usize, len: usize) -> Option<f64> {
        if end + 1 < len {
            return None;
        }
        candles[end + 1 - len..=end]
            .iter()
            .map(|c| c.high)
            .fold(None, |acc, h| Some(acc.map_or(h, |a: f64| a.max(h))))
    }

    fn window_low(candles: &[Candle], end: usize, len: usize) -> Option<f64> {
        if end + 1 < len {
            return None;
        }
        candles[end + 1 - len..=end]
            .iter()
            .map(|c| c.low)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
    }

    /// (highest high + lowest low) / 2 over a window
    fn midpoint(candles: &[Candle], end: usize, len: usize) -> Option<f64> {
        match (
            Self::window_high(candles, end, len),
            Self::window_low(candles, end, len),
        ) {
            (Some(h), Some(l)) => Some((h + l) / 2.0),
            _ => None,
        }
    }

    /// Ichimoku lines at bar `end`; Senkou spans are shifted forward by the
    /// kijun period, so their values come from `end - kijun` bars back.
    fn ichimoku_lines_at(&self, candles: &[Candle], end: usize) -> IchimokuLines {
        let t = self.config.ichimoku_tenkan;
        let k = self.config.ichimoku_kijun;
        let s = self.config.ichimoku_senkou_b;

        let tenkan = Self::midpoint(candles, end, t);
        let kijun = Self::midpoint(candles, end, k);

        let (senkou_a, senkou_b) = if end >= k {
            let shifted = end - k;
            let a = match (
                Self::midpoint(candles, shifted, t),
                Self::midpoint(candles, shifted, k),
            ) {
                (Some(tn), Some(kj)) => Some((tn + kj) / 2.0),
                _ => None,
            };
            (a, Self::midpoint(candles, shifted, s))
        } else {
            (None, None)
        };

        let (kumo_top, kumo_bottom) = match (senkou_a, senkou_b) {
            (Some(a), Some(b)) => (Some(a.max(b)), Some(a.min(b))),
            _ => (None, None),
        };

        IchimokuLines {
            tenkan,
            kijun,
            senkou_a,
            senkou_b,
            kumo_top,
            kumo_bottom,
        }
    }

    /// Averages up to three signed components; only components with valid
    /// values participate.
    pub fn ichimoku_trend_score(&self, candles: &[Candle]) -> f64 {
        if candles.is_empty() {
            return 0.0;
        }
        let last = candles.len() - 1;
        let lines = self.ichimoku_lines_at(candles, last);
        let close = candles[last].close;
        let mut scores: Vec<f64> = Vec::new();

        if let (Some(top), Some(bottom)) = (lines.kumo_top, lines.kumo_bottom) {
            if close > top {
                scores.push(1.0);
            } else if close < bottom {
                scores.push(-1.0);
            } else {
                let mid = (top + bottom) / 2.0;
                scores.push(if close > mid { 0.3 } else { -0.3 });
            }
        }

        if let (Some(tenkan), Some(kijun)) = (lines.tenkan, lines.kijun) {
            if tenkan > kijun {
                scores.push(0.8);
            } else if tenkan < kijun {
                scores.push(-0.8);
            }
        }

        if let (Some(a), Some(b)) = (lines.senkou_a, lines.senkou_b) {
            scores.push(if a > b { 0.6 } else { -0.6 });
        }

        if scores.is_empty() {
            return 0.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    /// TK cross (checked first) or kumo breakout between the last two bars.
    /// At most one signal per call.
    pub fn ichimoku_signal(&self, candles: &[Candle]) -> IchimokuSignal {
        if candles.len() < 3 {
            return IchimokuSignal::default();
        }
        let last = candles.len() - 1;
        let curr = self.ichimoku_lines_at(candles, last);
        let prev = self.ichimoku_lines_at(candles, last - 1);

        // TK cross
        if let (Some(ct), Some(ck), Some(pt), Some(pk)) =
            (curr.tenkan, curr.kijun, prev.tenkan, prev.kijun)
        {
            if pt <= pk && ct > ck {
                return IchimokuSignal {
                    signal: Some(SignalSide::Buy),
                    strength: 0.7,
                    event: Some(IchimokuEvent::TkCross),
                };
            }
            if pt >= pk && ct < ck {
                return IchimokuSignal {
                    signal: Some(SignalSide::Sell),
                    strength: 0.7,
                    event: Some(IchimokuEvent::TkCross),
                };
            }
        }

        // Kumo breakout
        let curr_close = candles[last].close;
        let prev_close = candles[last - 1].close;
        if let (Some(top), Some(bottom)) = (curr.kumo_top, curr.kumo_bottom) {
            let prev_top = prev.kumo_top.unwrap_or(f64::INFINITY);
            let prev_bottom = prev.kumo_bottom.unwrap_or(0.0);
            if prev_close <= prev_top && curr_close > top {
                return IchimokuSignal {
                    signal: Some(SignalSide::Buy),
                    strength: 0.9,
                    event: Some(IchimokuEvent::KumoBreakout),
                };
            }
            if prev_close >= prev_bottom && curr_close < bottom {
                return IchimokuSignal {
                    signal: Some(SignalSide::Sell),
                    strength: 0.9,
                    event: Some(IchimokuEvent::KumoBreakout),
                };
            }
        }

        IchimokuSignal::default()
    }

    // ── Fibonacci ───────────────────────────────────────────────

    fn swing_points(&self, candles: &[Candle]) -> Option<(f64, f64)> {
        let lookback = self.config.fibonacci_lookback;
        let start = candles.len().saturating_sub(lookback);
        let recent = &candles[start..];
        if recent.len() < 10 {
            return None;
        }
        let high = recent.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = recent.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        Some((high, low))
    }

    fn fibonacci_levels(&self, high: f64, low: f64, direction: SwingDirection) -> Vec<FibLevel> {
        let diff = high - low;
        let mut levels: Vec<FibLevel> = Vec::with_capacity(self.config.fibonacci_levels.len() + 2);
        match direction {
            SwingDirection::Up => {
                for &lv in &self.config.fibonacci_levels {
                    levels.push(FibLevel {
                        ratio: lv,
                        price: high - diff * lv,
                    });
                }
                levels.push(FibLevel {
                    ratio: 1.272,
                    price: high + diff * 0.272,
                });
                levels.push(FibLevel {
                    ratio: 1.618,
                    price: high + diff * 0.618,
                });
            }
            SwingDirection::Down => {
                for &lv in &self.config.fibonacci_levels {
                    levels.push(FibLevel {
                        ratio: lv,
                        price: low + diff * lv,
                    });
                }
                levels.push(FibLevel {
                    ratio: 1.272,
                    price: low - diff * 0.272,
                });
                levels.push(FibLevel {
                    ratio: 1.618,
                    price: low - diff * 0.618,
                });
            }
        }
        levels
    }

    /// Support/resistance strength from proximity to the nearest level.
    /// Key retracements (38.2/50/61.8) get a 1.3x boost, capped at 1.0.
    pub fn fibonacci_score(&self, candles: &[Candle]) -> FibonacciScore {
        let (high, low) = match self.swing_points(candles) {
            Some(points) => points,
            None => return FibonacciScore::default(),
        };

        let price = candles[candles.len() - 1].close;
        let direction = if price > (high + low) / 2.0 {
            SwingDirection::Up
        } else {
            SwingDirection::Down
        };
        let levels = self.fibonacci_levels(high, low, direction);

        let tolerance = 0.005;
        let mut min_dist = f64::INFINITY;
        let mut nearest: Option<FibLevel> = None;
        for level in &levels {
            let dist = (price - level.price).abs() / price;
            if dist < min_dist {
                min_dist = dist;
                nearest = Some(*level);
            }
        }

        let mut strength = if min_dist <= tolerance {
            (1.0 - min_dist / tolerance).max(0.0)
        } else {
            0.0
        };
        if let Some(level) = nearest {
            let key_level = [0.382, 0.5, 0.618]
                .iter()
                .any(|k| (level.ratio - k).abs() < 1e-9);
            if key_level {
                strength = (strength * 1.3).min(1.0);
            }
        }

        let is_support = nearest.map(|l| price >= l.price).unwrap_or(false);
        FibonacciScore {
            support_score: if is_support { strength } else { 0.0 },
            resistance_score: if is_support { 0.0 } else { strength },
            levels,
            nearest,
            direction: Some(direction),
        }
    }

    // ── RSI ─────────────────────────────────────────────────────

    /// RSI at bar `end` from a simple rolling mean of gains/losses
    fn rsi_at(&self, candles: &[Candle], end: usize) -> Option<f64> {
        let period = self.config.rsi_period;
        if end + 1 < period + 1 {
            return None;
        }
        let mut gains = 0.0;
        let mut losses = 0.0;
        for i in (end + 1 - period)..=end {
            let change = candles[i].close - candles[i - 1].close;
            if change > 0.0 {
                gains += change;
            } else {
                losses += change.abs();
            }
        }
        let avg_gain = gains / period as f64;
        let avg_loss = losses / period as f64;
        if avg_gain == 0.0 && avg_loss == 0.0 {
            return None;
        }
        if avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }

    /// Banded RSI signal: strong at the extremes, weak bias outside the
    /// 45-55 neutral zone, recovery/rollover bands at 25-35 / 65-75.
    pub fn rsi_signal(&self, candles: &[Candle]) -> RsiSignal {
        if candles.len() < 2 {
            return RsiSignal::default();
        }
        let last = candles.len() - 1;
        let rsi = match self.rsi_at(candles, last) {
            Some(v) => v,
            None => return RsiSignal::default(),
        };
        let rsi_prev = self.rsi_at(candles, last - 1);

        let rising = rsi_prev.map(|p| rsi > p).unwrap_or(false);
        let falling = rsi_prev.map(|p| rsi < p).unwrap_or(false);

        let (signal, strength) = if rsi < 25.0 {
            (Some(SignalSide::Buy), 1.0)
        } else if rsi < 35.0 && rising {
            (Some(SignalSide::Buy), 0.7)
        } else if rsi > 75.0 {
            (Some(SignalSide::Sell), 1.0)
        } else if rsi > 65.0 && falling {
            (Some(SignalSide::Sell), 0.7)
        } else if (45.0..=55.0).contains(&rsi) {
            (None, 0.0)
        } else if rsi < 45.0 {
            (Some(SignalSide::Buy), 0.3)
        } else {
            (Some(SignalSide::Sell), 0.3)
        };

        RsiSignal {
            signal,
            strength,
            value: rsi,
        }
    }

    // ── Volume ──────────────────────────────────────────────────

    /// Volume ratio vs its rolling mean; confirms or penalizes the move
    pub fn volume_signal(&self, candles: &[Candle]) -> VolumeSignal {
        let period = self.config.volume_period;
        if candles.len() < period || candles.len() < 2 {
            return VolumeSignal::default();
        }
        let last = candles.len() - 1;
        let sma: f64 = candles[candles.len() - period..]
            .iter()
            .map(|c| c.volume)
            .sum::<f64>()
            / period as f64;
        if sma <= 0.0 {
            return VolumeSignal::default();
        }
        let ratio = candles[last].volume / sma;
        let prev_close = candles[last - 1].close;
        if prev_close <= 0.0 {
            return VolumeSignal::default();
        }
        let price_change = (candles[last].close - prev_close) / prev_close;

        if ratio > 1.5 && price_change > 0.0 {
            VolumeSignal {
                signal: Some(SignalSide::Buy),
                strength: (ratio / 2.0).min(1.0),
                ratio,
            }
        } else if ratio > 1.5 && price_change < 0.0 {
            VolumeSignal {
                signal: Some(SignalSide::Sell),
                strength: (ratio / 2.0).min(1.0),
                ratio,
            }
        } else if ratio < 0.5 {
            // Thin volume penalizes low-conviction moves
            VolumeSignal {
                signal: None,
                strength: -0.3,
                ratio,
            }
        } else {
            VolumeSignal {
                signal: None,
                strength: 0.0,
                ratio,
            }
        }
    }

    // ── ATR ─────────────────────────────────────────────────────

    /// Average True Range over the configured period
    pub fn atr(&self, candles: &[Candle]) -> Option<f64> {
        let period = self.config.atr_period;
        if candles.len() < period + 1 {
            return None;
        }
        let mut sum = 0.0;
        for i in candles.len() - period..candles.len() {
            let curr = &candles[i];
            let prev = &candles[i - 1];
            let tr = (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs());
            sum += tr;
        }
        Some(sum / period as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn indicator_set() -> IndicatorSet {
        IndicatorSet::new(AppConfig::load().unwrap().indicators)
    }

    fn make_candle(ts: i64, close: f64) -> Candle {
        Candle {
            ts,
            open: close - 0.1,
            high: close + 0.2,
            low: close - 0.2,
            close,
            volume: 1000.0,
        }
    }

    fn trending_candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| make_candle(1_700_000_000 + i as i64 * 300, start + i as f64 * step))
            .collect()
    }

    #[test]
    fn test_ema_alignment_bounds_and_extremes() {
        let set = indicator_set();

        // Strong uptrend stacks every shorter EMA above the longer ones
        let up = trending_candles(250, 100.0, 0.5);
        let score_up = set.ema_alignment_score(&up);
        assert!((score_up - 1.0).abs() < 1e-9, "got {score_up}");

        // Strong downtrend inverts the ordering completely
        let down = trending_candles(250, 250.0, -0.5);
        let score_down = set.ema_alignment_score(&down);
        assert!((score_down + 1.0).abs() < 1e-9, "got {score_down}");

        // Always within [-1, 1]
        for n in [1, 10, 60, 250] {
            let candles = trending_candles(n, 100.0, 0.1);
            let s = set.ema_alignment_score(&candles);
            assert!((-1.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_ema_alignment_neutral_without_data() {
        let set = indicator_set();
        assert_eq!(set.ema_alignment_score(&[]), 0.0);
        // Below the shortest period every EMA is undefined
        let few = trending_candles(5, 100.0, 1.0);
        assert_eq!(set.ema_alignment_score(&few), 0.0);
    }

    #[test]
    fn test_ema_crossover_detected_in_recovery() {
        let set = indicator_set();
        // V-shape: decline then recovery; the short EMA must cross above the
        // long EMA somewhere on the way back up.
        let mut candles = trending_candles(60, 160.0, -1.0);
        let bottom = candles.last().unwrap().close;
        for i in 0..60 {
            candles.push(make_candle(
                1_700_000_000 + (60 + i) * 300,
                bottom + (i + 1) as f64 * 1.5,
            ));
        }

        let mut buys = 0;
        let mut sells_in_recovery = 0;
        for end in 62..=candles.len() {
            let cross = set.ema_crossover_signal(&candles[..end]);
            match cross.signal {
                Some(SignalSide::Buy) => {
                    buys += 1;
                    assert!(cross.strength > 0.0 && cross.strength <= 1.0);
                }
                Some(SignalSide::Sell) => sells_in_recovery += 1,
                None => {}
            }
        }
        assert!(buys >= 1, "expected a bullish crossover in the recovery leg");
        assert_eq!(sells_in_recovery, 0);
    }

    #[test]
    fn test_ema_crossover_needs_three_bars() {
        let set = indicator_set();
        let candles = trending_candles(2, 100.0, 1.0);
        let cross = set.ema_crossover_signal(&candles);
        assert!(cross.signal.is_none());
        assert_eq!(cross.strength, 0.0);
    }

    #[test]
    fn test_rsi_band_boundaries() {
        let set = indicator_set();
        // Oscillating walk: exercise many windows and check the band rules
        let mut candles = Vec::new();
        for i in 0..200usize {
            let phase = i as f64 * 0.37;
            let close = 100.0 + 8.0 * phase.sin() + 0.05 * i as f64;
            candles.push(make_candle(1_700_000_000 + i as i64 * 300, close));
        }
        for end in 20..=candles.len() {
            let sig = set.rsi_signal(&candles[..end]);
            assert!((0.0..=100.0).contains(&sig.value));
            if sig.value > 55.0 {
                assert_ne!(sig.signal, Some(SignalSide::Buy), "RSI {}", sig.value);
            }
            if sig.value < 45.0 {
                assert_ne!(sig.signal, Some(SignalSide::Sell), "RSI {}", sig.value);
            }
        }
    }

    #[test]
    fn test_rsi_extremes() {
        let set = indicator_set();
        // Relentless uptrend: no losses at all -> RSI 100, strong sell
        let up = trending_candles(30, 100.0, 1.0);
        let sig = set.rsi_signal(&up);
        assert_eq!(sig.value, 100.0);
        assert_eq!(sig.signal, Some(SignalSide::Sell));
        assert_eq!(sig.strength, 1.0);

        // Relentless downtrend -> RSI 0, strong buy
        let down = trending_candles(30, 200.0, -1.0);
        let sig = set.rsi_signal(&down);
        assert!(sig.value < 25.0);
        assert_eq!(sig.signal, Some(SignalSide::Buy));
        assert_eq!(sig.strength, 1.0);
    }

    #[test]
    fn test_rsi_neutral_on_insufficient_data() {
        let set = indicator_set();
        let few = trending_candles(5, 100.0, 1.0);
        let sig = set.rsi_signal(&few);
        assert!(sig.signal.is_none());
        assert_eq!(sig.value, 50.0);
        assert_eq!(sig.strength, 0.0);
    }

    #[test]
    fn test_volume_spike_confirms_direction() {
        let set = indicator_set();
        let mut candles = trending_candles(30, 100.0, 0.0);
        // Price up on 3x volume -> buy
        let mut spike = make_candle(1_700_000_000 + 30 * 300, 101.0);
        spike.volume = 3000.0;
        candles.push(spike);
        let sig = set.volume_signal(&candles);
        assert_eq!(sig.signal, Some(SignalSide::Buy));
        assert!(sig.ratio > 2.0);
        assert!(sig.strength > 0.9);

        // Price down on 3x volume -> sell
        let mut candles = trending_candles(30, 100.0, 0.0);
        let mut spike = make_candle(1_700_000_000 + 30 * 300, 99.0);
        spike.volume = 3000.0;
        candles.push(spike);
        let sig = set.volume_signal(&candles);
        assert_eq!(sig.signal, Some(SignalSide::Sell));
    }

    #[test]
    fn test_thin_volume_penalty() {
        let set = indicator_set();
        let mut candles = trending_candles(30, 100.0, 0.1);
        let mut thin = make_candle(1_700_000_000 + 30 * 300, 103.2);
        thin.volume = 100.0;
        candles.push(thin);
        let sig = set.volume_signal(&candles);
        assert!(sig.signal.is_none());
        assert_eq!(sig.strength, -0.3);
        assert!(sig.ratio < 0.5);
    }

    #[test]
    fn test_fibonacci_insufficient_data() {
        let set = indicator_set();
        let few = trending_candles(5, 100.0, 1.0);
        let score = set.fibonacci_score(&few);
        assert_eq!(score.support_score, 0.0);
        assert_eq!(score.resistance_score, 0.0);
        assert!(score.levels.is_empty());
    }

    #[test]
    fn test_fibonacci_key_level_support() {
        let set = indicator_set();
        // Swing 90..110; last close exactly on the 38.2% retracement of the
        // up-leg (110 - 20*0.382 = 102.36), above the midpoint -> direction
        // up, on-level support with the key-level boost capped at 1.0.
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..60 {
            candles.push(Candle {
                ts: 1_700_000_000 + i * 300,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 1000.0,
            });
        }
        candles.push(Candle {
            ts: 1_700_000_000 + 60 * 300,
            open: 100.0,
            high: 100.5,
            low: 90.0,
            close: 100.0,
            volume: 1000.0,
        });
        candles.push(Candle {
            ts: 1_700_000_000 + 61 * 300,
            open: 100.0,
            high: 110.0,
            low: 99.5,
            close: 100.0,
            volume: 1000.0,
        });
        candles.push(Candle {
            ts: 1_700_000_000 + 62 * 300,
            open: 102.0,
            high: 102.5,
            low: 101.9,
            close: 102.36,
            volume: 1000.0,
        });

        let score = set.fibonacci_score(&candles);
        assert_eq!(score.direction, Some(SwingDirection::Up));
        let nearest = score.nearest.expect("nearest level");
        assert!((nearest.ratio - 0.382).abs() < 1e-9);
        assert!((score.support_score - 1.0).abs() < 1e-6);
        assert_eq!(score.resistance_score, 0.0);
    }

    #[test]
    fn test_ichimoku_trend_positive_in_uptrend() {
        let set = indicator_set();
        let candles = trending_candles(120, 100.0, 0.5);
        let score = set.ichimoku_trend_score(&candles);
        assert!(score > 0.5, "got {score}");
        assert!((-1.0..=1.0).contains(&score));

        let down = trending_candles(120, 200.0, -0.5);
        let score = set.ichimoku_trend_score(&down);
        assert!(score < -0.5, "got {score}");
    }

    #[test]
    fn test_ichimoku_signal_neutral_on_short_series() {
        let set = indicator_set();
        let sig = set.ichimoku_signal(&trending_candles(2, 100.0, 1.0));
        assert!(sig.signal.is_none());
        assert!(sig.event.is_none());
    }

    #[test]
    fn test_ichimoku_lines_present_with_enough_data() {
        let set = indicator_set();
        let candles = trending_candles(120, 100.0, 0.5);
        let lines = set.ichimoku_lines_at(&candles, candles.len() - 1);
        assert!(lines.tenkan.is_some());
        assert!(lines.kijun.is_some());
        assert!(lines.kumo_top.is_some());
        assert!(lines.kumo_bottom.unwrap() <= lines.kumo_top.unwrap());
    }

    #[test]
    fn test_atr_and_atr_pct() {
        let set = indicator_set();
        let candles = trending_candles(30, 100.0, 0.5);
        let scores = set.get_all_scores(&candles);
        let atr = scores.atr.expect("atr with 30 bars");
        assert!(atr > 0.0);
        let atr_pct = scores.atr_pct.unwrap();
        assert!(atr_pct > 0.0 && atr_pct < 100.0);

        // Not enough bars -> no ATR
        let few = trending_candles(10, 100.0, 0.5);
        assert!(set.atr(&few).is_none());
    }

    #[test]
    fn test_get_all_scores_on_empty_input() {
        let set = indicator_set();
        let scores = set.get_all_scores(&[]);
        assert_eq!(scores.ema_alignment, 0.0);
        assert!(scores.rsi.signal.is_none());
        assert!(scores.atr.is_none());
    }
}
