//! Position manager
//!
//! Owns the open/closed position lists and their lifecycle:
//! open (risk-sized, via the swap venue) → monitor (stop-loss, take-profit,
//! trailing stop, priority in that order) → close (reverse swap). External
//! readers only ever receive cloned snapshots. State is persisted to a JSON
//! document after every structural mutation; a failed write never rolls back
//! the in-memory mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::swap::SwapVenue;
use crate::types::{Direction, TradeSignal};

/// Hard cap on the fraction of capital committed to a single trade,
/// regardless of stop distance.
const MAX_CAPITAL_FRACTION: f64 = 0.30;

const POSITIONS_FILE: &str = "positions.json";

/// Lifecycle state of a position; `Open` is the only non-terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosedSl,
    ClosedTp1,
    ClosedTp2,
    ClosedTp3,
    ClosedManual,
}

/// Why a position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    /// 1-based take-profit level index
    TakeProfit(u8),
    Manual,
}

impl CloseReason {
    pub fn status(&self) -> PositionStatus {
        match self {
            CloseReason::StopLoss => PositionStatus::ClosedSl,
            CloseReason::TakeProfit(1) => PositionStatus::ClosedTp1,
            CloseReason::TakeProfit(2) => PositionStatus::ClosedTp2,
            CloseReason::TakeProfit(_) => PositionStatus::ClosedTp3,
            CloseReason::Manual => PositionStatus::ClosedManual,
        }
    }

    /// Event label for reports ("stop_loss", "take_profit_1", "manual")
    pub fn label(&self) -> String {
        match self {
            CloseReason::StopLoss => "stop_loss".to_string(),
            CloseReason::TakeProfit(i) => format!("take_profit_{i}"),
            CloseReason::Manual => "manual".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub current_price: f64,
    /// Base-asset units received from the opening swap
    pub quantity: f64,
    /// Quote-asset amount invested
    pub quantity_base: f64,
    /// Mutable: trailing only ever tightens it
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub opened_at: DateTime<Utc>,
    pub tx_hash: String,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub status: PositionStatus,
}

impl Position {
    /// Refresh mark price and unrealized P&L
    fn refresh(&mut self, price: f64) {
        self.current_price = price;
        if self.entry_price > 0.0 {
            self.pnl_pct = (price - self.entry_price) / self.entry_price * 100.0;
            self.pnl_usd = self.quantity_base * self.pnl_pct / 100.0;
        }
    }
}

/// A position transition out of `Open`, reported to the caller
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub reason: CloseReason,
    /// Snapshot of the position after the close was applied
    pub position: Position,
    /// Transaction id of the closing swap
    pub tx_hash: String,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn to_smallest_units(amount: f64, decimals: u8) -> u64 {
    (amount * 10f64.powi(decimals as i32)) as u64
}

fn from_smallest_units(amount: u64, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

/// Persisted form of a position; pnl fields rounded to 2 decimals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub quantity_base: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub opened_at: DateTime<Utc>,
    pub tx_hash: String,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub status: PositionStatus,
}

impl From<&Position> for PositionRecord {
    fn from(p: &Position) -> Self {
        Self {
            id: p.id.clone(),
            symbol: p.symbol.clone(),
            direction: p.direction,
            entry_price: p.entry_price,
            current_price: p.current_price,
            quantity: p.quantity,
            quantity_base: p.quantity_base,
            stop_loss: p.stop_loss,
            take_profits: p.take_profits.clone(),
            opened_at: p.opened_at,
            tx_hash: p.tx_hash.clone(),
            pnl_pct: round2(p.pnl_pct),
            pnl_usd: round2(p.pnl_usd),
            status: p.status,
        }
    }
}

impl From<PositionRecord> for Position {
    fn from(r: PositionRecord) -> Self {
        Self {
            id: r.id,
            symbol: r.symbol,
            direction: r.direction,
            entry_price: r.entry_price,
            current_price: r.current_price,
            quantity: r.quantity,
            quantity_base: r.quantity_base,
            stop_loss: r.stop_loss,
            take_profits: r.take_profits,
            opened_at: r.opened_at,
            tx_hash: r.tx_hash,
            pnl_pct: r.pnl_pct,
            pnl_usd: r.pnl_usd,
            status: r.status,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    open: Vec<PositionRecord>,
    closed: Vec<PositionRecord>,
}

/// Summary of position state for reporting
#[derive(Debug, Clone, Serialize)]
pub struct PositionsSummary {
    pub open_positions: usize,
    pub open_pnl_usd: f64,
    pub closed_pnl_usd: f64,
    pub total_pnl_usd: f64,
    pub total_trades: usize,
    pub win_rate_pct: Option<f64>,
    pub current_price: f64,
}

pub struct PositionManager {
    state_path: PathBuf,
    positions: Vec<Position>,
    closed_positions: Vec<Position>,
}

impl PositionManager {
    /// Load persisted positions from `data_dir`; a missing or malformed
    /// state file means starting empty, never a failure.
    pub fn new(data_dir: &Path) -> Self {
        let state_path = data_dir.join(POSITIONS_FILE);
        let (positions, closed_positions) = Self::load(&state_path);
        Self {
            state_path,
            positions,
            closed_positions,
        }
    }

    fn load(path: &Path) -> (Vec<Position>, Vec<Position>) {
        let file: PositionsFile = match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed positions file, starting empty");
                    PositionsFile::default()
                }
            },
            Err(_) => PositionsFile::default(),
        };
        (
            file.open.into_iter().map(Position::from).collect(),
            file.closed.into_iter().map(Position::from).collect(),
        )
    }

    fn save(&self) {
        let file = PositionsFile {
            open: self.positions.iter().map(PositionRecord::from).collect(),
            closed: self
                .closed_positions
                .iter()
                .map(PositionRecord::from)
                .collect(),
        };
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.state_path, json) {
                    warn!(path = %self.state_path.display(), error = %e, "Failed to persist positions");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize positions"),
        }
    }

    // ── Snapshots for readers ───────────────────────────────────

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.clone()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed_positions.clone()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Aggregate P&L snapshot against the given mark price
    pub fn summary(&self, current_price: f64) -> PositionsSummary {
        let open_pnl: f64 = self
            .positions
            .iter()
            .map(|p| {
                let mut snapshot = p.clone();
                snapshot.refresh(current_price);
                snapshot.pnl_usd
            })
            .sum();
        let closed_pnl: f64 = self.closed_positions.iter().map(|p| p.pnl_usd).sum();
        let total_trades = self.closed_positions.len();
        let wins = self
            .closed_positions
            .iter()
            .filter(|p| p.pnl_usd > 0.0)
            .count();
        PositionsSummary {
            open_positions: self.positions.len(),
            open_pnl_usd: round2(open_pnl),
            closed_pnl_usd: round2(closed_pnl),
            total_pnl_usd: round2(open_pnl + closed_pnl),
            total_trades,
            win_rate_pct: if total_trades > 0 {
                Some(wins as f64 / total_trades as f64 * 100.0)
            } else {
                None
            },
            current_price,
        }
    }

    // ── Open ────────────────────────────────────────────────────

    /// Open a position for a signal: size by risk, swap quote→execute,
    /// append and persist. Returns None (with no state mutation) when the
    /// position limit is reached, the signal is short (spot DEX cannot
    /// short), sizing degenerates, or any swap step fails.
    pub async fn open_position(
        &mut self,
        signal: &TradeSignal,
        current_price: f64,
        config: &AppConfig,
        effective_risk: f64,
        venue: &dyn SwapVenue,
    ) -> Option<Position> {
        if self.positions.len() >= config.risk.max_open_positions {
            warn!(
                open = self.positions.len(),
                max = config.risk.max_open_positions,
                "Max open positions reached, signal dropped"
            );
            return None;
        }

        if signal.direction == Direction::Short {
            // Spot DEX cannot short; this is an unsupported case, not a bug
            warn!("Short signal ignored: spot DEX has no short side");
            return None;
        }

        let risk_amount = config.risk.capital_usdc * effective_risk;
        let risk_per_unit = (signal.entry_price - signal.stop_loss).abs();
        if risk_per_unit <= 0.0 || signal.entry_price <= 0.0 {
            warn!("Degenerate risk per unit, signal dropped");
            return None;
        }

        let invest_usdc = (risk_amount / (risk_per_unit / signal.entry_price))
            .min(config.risk.capital_usdc * MAX_CAPITAL_FRACTION);
        if invest_usdc <= 0.0 {
            warn!("Non-positive position size, signal dropped");
            return None;
        }

        let (input_mint, output_mint) = match (config.tokens.base_mint(), config.tokens.trade_mint())
        {
            (Some(base), Some(trade)) => (base.to_string(), trade.to_string()),
            _ => {
                warn!("Token mints missing from configuration, signal dropped");
                return None;
            }
        };
        let amount = to_smallest_units(invest_usdc, config.tokens.base_decimals());

        let quote = match venue
            .quote(&input_mint, &output_mint, amount, config.jupiter.slippage_bps)
            .await
        {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "Open aborted: quote failed");
                return None;
            }
        };

        let tx_hash = match venue.execute(&quote).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "Open aborted: swap failed");
                return None;
            }
        };

        let quantity = from_smallest_units(quote.out_amount, config.tokens.trade_decimals());
        let position = Position {
            id: format!("pos_{}", Uuid::new_v4().simple()),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price: current_price,
            current_price,
            quantity,
            quantity_base: invest_usdc,
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits.clone(),
            opened_at: Utc::now(),
            tx_hash,
            pnl_pct: 0.0,
            pnl_usd: 0.0,
            status: PositionStatus::Open,
        };

        info!(
            id = %position.id,
            direction = %position.direction,
            invest = %format!("${invest_usdc:.2}"),
            quantity = %format!("{quantity:.6}"),
            "Position opened"
        );

        self.positions.push(position.clone());
        self.save();
        Some(position)
    }

    // ── Close ───────────────────────────────────────────────────

    /// Close an open position through the reverse swap. On any failure the
    /// position is left open and unmutated; the monitoring loop will
    /// re-trigger next cycle.
    pub async fn close_position(
        &mut self,
        position_id: &str,
        reason: CloseReason,
        current_price: f64,
        config: &AppConfig,
        venue: &dyn SwapVenue,
    ) -> Option<CloseEvent> {
        let idx = self.positions.iter().position(|p| p.id == position_id)?;
        let (direction, quantity) = {
            let p = &self.positions[idx];
            (p.direction, p.quantity)
        };
        if direction != Direction::Long {
            return None;
        }

        let (input_mint, output_mint) = match (config.tokens.trade_mint(), config.tokens.base_mint())
        {
            (Some(trade), Some(base)) => (trade.to_string(), base.to_string()),
            _ => {
                warn!("Token mints missing from configuration, close skipped");
                return None;
            }
        };
        let amount = to_smallest_units(quantity, config.tokens.trade_decimals());

        let quote = match venue
            .quote(&input_mint, &output_mint, amount, config.jupiter.slippage_bps)
            .await
        {
            Ok(q) => q,
            Err(e) => {
                warn!(id = %position_id, error = %e, "Close aborted: quote failed, position stays open");
                return None;
            }
        };
        let tx_hash = match venue.execute(&quote).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(id = %position_id, error = %e, "Close aborted: swap failed, position stays open");
                return None;
            }
        };

        let mut position = self.positions.remove(idx);
        position.refresh(current_price);
        position.status = reason.status();
        self.closed_positions.push(position.clone());
        self.save();

        info!(
            id = %position.id,
            reason = %reason.label(),
            pnl_pct = %format!("{:+.2}%", position.pnl_pct),
            pnl_usd = %format!("{:+.2}", position.pnl_usd),
            "Position closed"
        );

        Some(CloseEvent {
            reason,
            position,
            tx_hash,
        })
    }

    // ── Monitor ─────────────────────────────────────────────────

    /// Evaluate every open position against the cycle's mark price.
    /// Priority per position: stop-loss, then the first satisfied
    /// take-profit, then the trailing-stop raise (which runs after the exit
    /// checks so it cannot dodge a same-cycle close).
    pub async fn check_positions(
        &mut self,
        current_price: f64,
        config: &AppConfig,
        venue: &dyn SwapVenue,
    ) -> Vec<CloseEvent> {
        let mut events = Vec::new();
        let ids: Vec<String> = self.positions.iter().map(|p| p.id.clone()).collect();

        for id in ids {
            let (direction, stop_loss, take_profits, entry_price) = {
                let pos = match self.positions.iter_mut().find(|p| p.id == id) {
                    Some(p) => p,
                    None => continue,
                };
                pos.refresh(current_price);
                (
                    pos.direction,
                    pos.stop_loss,
                    pos.take_profits.clone(),
                    pos.entry_price,
                )
            };

            // 1. Stop loss
            if direction == Direction::Long && current_price <= stop_loss {
                if let Some(event) = self
                    .close_position(&id, CloseReason::StopLoss, current_price, config, venue)
                    .await
                {
                    events.push(event);
                }
                continue;
            }

            // 2. Take profits: only the first satisfied level triggers
            let mut closed = false;
            for (i, tp) in take_profits.iter().enumerate() {
                if direction == Direction::Long && current_price >= *tp {
                    if let Some(event) = self
                        .close_position(
                            &id,
                            CloseReason::TakeProfit(i as u8 + 1),
                            current_price,
                            config,
                            venue,
                        )
                        .await
                    {
                        events.push(event);
                    }
                    closed = true;
                    break;
                }
            }
            if closed {
                continue;
            }

            // 3. Trailing stop: monotonic tightening only, in profit only
            if config.risk.trailing_stop && direction == Direction::Long {
                let candidate = current_price * (1.0 - config.risk.trailing_stop_pct);
                if candidate > stop_loss && current_price > entry_price {
                    if let Some(pos) = self.positions.iter_mut().find(|p| p.id == id) {
                        info!(
                            id = %id,
                            old = %format!("{:.4}", pos.stop_loss),
                            new = %format!("{:.4}", candidate),
                            "Trailing stop raised"
                        );
                        pos.stop_loss = candidate;
                    }
                }
            }
        }

        self.save();
        events
    }

    #[cfg(test)]
    pub(crate) fn inject_position(&mut self, position: Position) {
        self.positions.push(position);
    }
}
