//! Configuration management for SolBot
//!
//! Defaults in code, overridable by config files + environment variables via
//! .env. The bot re-loads this every cycle, so edits to config/local.* take
//! effect without a restart.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::IndicatorKind;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub tokens: TokensConfig,
    pub timeframes: TimeframesConfig,
    pub indicators: IndicatorsConfig,
    pub confluence: ConfluenceConfig,
    pub risk: RiskConfig,
    pub jupiter: JupiterConfig,
    pub price_data: PriceDataConfig,
    pub persistence: PersistenceConfig,
    pub solana: SolanaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// Paper trading mode — swaps are simulated, nothing touches the chain
    pub paper_trading: bool,
    /// Open positions automatically when a signal fires
    pub auto_trading: bool,
    /// Wire the learning engine in as the weight source
    pub learning_enabled: bool,
    /// Seconds between analysis cycles
    pub loop_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    /// Quote asset symbol (deposited capital)
    pub base_symbol: String,
    /// Base asset symbol (the token being traded)
    pub trade_symbol: String,
    /// Mint addresses by symbol (keys are lowercased by the config layer)
    pub mints: HashMap<String, String>,
    /// On-chain decimals by symbol (keys are lowercased by the config layer)
    pub decimals: HashMap<String, u8>,
}

impl TokensConfig {
    pub fn pair(&self) -> String {
        format!("{}/{}", self.trade_symbol, self.base_symbol)
    }

    pub fn base_mint(&self) -> Option<&str> {
        self.mints
            .get(&self.base_symbol.to_lowercase())
            .map(String::as_str)
    }

    pub fn trade_mint(&self) -> Option<&str> {
        self.mints
            .get(&self.trade_symbol.to_lowercase())
            .map(String::as_str)
    }

    pub fn base_decimals(&self) -> u8 {
        self.decimals
            .get(&self.base_symbol.to_lowercase())
            .copied()
            .unwrap_or(6)
    }

    pub fn trade_decimals(&self) -> u8 {
        self.decimals
            .get(&self.trade_symbol.to_lowercase())
            .copied()
            .unwrap_or(9)
    }
}

/// Timeframe labels by role (GeckoTerminal notation: "5m", "15m", "1h", ...)
#[derive(Debug, Clone, Deserialize)]
pub struct TimeframesConfig {
    pub execution: String,
    pub confirmation: String,
    pub trend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorsConfig {
    /// EMA periods for the alignment score
    pub ema_periods: Vec<usize>,
    /// EMA crossover short/long periods
    pub ema_cross_short: usize,
    pub ema_cross_long: usize,
    pub ichimoku_tenkan: usize,
    pub ichimoku_kijun: usize,
    pub ichimoku_senkou_b: usize,
    /// Fibonacci retracement ratios (extensions 1.272/1.618 are implied)
    pub fibonacci_levels: Vec<f64>,
    pub fibonacci_lookback: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub volume_period: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfluenceConfig {
    /// Minimum confidence to emit a signal
    pub threshold: f64,
    /// Minimum count of agreeing indicators
    pub min_indicators_agree: usize,
    /// Static indicator weights (row-normalized by the scoring engine)
    pub weights: HashMap<IndicatorKind, f64>,
}

/// How the stop-loss level is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopLossMode {
    /// Fixed percentage from entry
    Fixed,
    /// Tightest valid level from kumo / kijun / fibonacci / 2×ATR
    Dynamic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Capital available in the quote asset (USDC)
    pub capital_usdc: f64,
    /// Fraction of capital risked per trade (e.g. 0.015 = 1.5%)
    pub risk_per_trade: f64,
    pub max_open_positions: usize,
    pub stop_loss_mode: StopLossMode,
    /// Stop distance when stop_loss_mode = fixed (e.g. 0.02 = 2%)
    pub fixed_stop_loss_pct: f64,
    /// R:R multiples for the take-profit ladder
    pub take_profit_levels: Vec<f64>,
    pub trailing_stop: bool,
    /// Trailing distance (e.g. 0.015 = 1.5%)
    pub trailing_stop_pct: f64,
    /// Minimum risk/reward to accept a signal
    pub min_risk_reward: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JupiterConfig {
    pub quote_url: String,
    pub swap_url: String,
    /// Slippage tolerance in basis points
    pub slippage_bps: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceDataConfig {
    /// GeckoTerminal pool address for the traded pair
    pub gecko_pool_address: String,
    /// Candles requested per timeframe
    pub candle_limit: usize,
    /// Delay between per-timeframe requests (GeckoTerminal ~30 req/min)
    pub request_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for positions / trade history / learning state JSON
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    pub rpc_url: String,
}

impl AppConfig {
    /// Load configuration from defaults, files, and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Bot defaults
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.paper_trading", true)?
            .set_default("bot.auto_trading", true)?
            .set_default("bot.learning_enabled", true)?
            .set_default("bot.loop_interval_secs", 45)?
            // Token defaults — SOL/USDC (high liquidity pair)
            .set_default("tokens.base_symbol", "USDC")?
            .set_default("tokens.trade_symbol", "SOL")?
            .set_default(
                "tokens.mints.sol",
                "So11111111111111111111111111111111111111112",
            )?
            .set_default(
                "tokens.mints.usdc",
                "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            )?
            .set_default("tokens.decimals.sol", 9)?
            .set_default("tokens.decimals.usdc", 6)?
            // Timeframe defaults (day-trade profile)
            .set_default("timeframes.execution", "5m")?
            .set_default("timeframes.confirmation", "15m")?
            .set_default("timeframes.trend", "1h")?
            // Indicator defaults
            .set_default("indicators.ema_periods", vec![9, 21, 50, 200])?
            .set_default("indicators.ema_cross_short", 9)?
            .set_default("indicators.ema_cross_long", 21)?
            .set_default("indicators.ichimoku_tenkan", 9)?
            .set_default("indicators.ichimoku_kijun", 26)?
            .set_default("indicators.ichimoku_senkou_b", 52)?
            .set_default(
                "indicators.fibonacci_levels",
                vec![0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0],
            )?
            .set_default("indicators.fibonacci_lookback", 100)?
            .set_default("indicators.rsi_period", 14)?
            .set_default("indicators.atr_period", 14)?
            .set_default("indicators.volume_period", 20)?
            // Confluence defaults
            .set_default("confluence.threshold", 0.50)?
            .set_default("confluence.min_indicators_agree", 3)?
            .set_default("confluence.weights.ichimoku_trend", 0.18)?
            .set_default("confluence.weights.ichimoku_signal", 0.12)?
            .set_default("confluence.weights.ema_alignment", 0.15)?
            .set_default("confluence.weights.ema_crossover", 0.10)?
            .set_default("confluence.weights.fibonacci_support", 0.12)?
            .set_default("confluence.weights.fibonacci_resistance", 0.08)?
            .set_default("confluence.weights.rsi", 0.15)?
            .set_default("confluence.weights.volume", 0.10)?
            // Risk defaults
            .set_default("risk.capital_usdc", 500.0)?
            .set_default("risk.risk_per_trade", 0.015)?
            .set_default("risk.max_open_positions", 3)?
            .set_default("risk.stop_loss_mode", "dynamic")?
            .set_default("risk.fixed_stop_loss_pct", 0.02)?
            .set_default("risk.take_profit_levels", vec![1.0, 1.5, 2.0])?
            .set_default("risk.trailing_stop", true)?
            .set_default("risk.trailing_stop_pct", 0.015)?
            .set_default("risk.min_risk_reward", 1.2)?
            // Jupiter defaults
            .set_default("jupiter.quote_url", "https://quote-api.jup.ag/v6/quote")?
            .set_default("jupiter.swap_url", "https://quote-api.jup.ag/v6/swap")?
            .set_default("jupiter.slippage_bps", 50)?
            // Price data defaults
            .set_default(
                "price_data.gecko_pool_address",
                "FpCMFDFGYotvufJ7HrFHsWEiiQCGbkLCtwHiDnh7o28Q",
            )?
            .set_default("price_data.candle_limit", 300)?
            .set_default("price_data.request_delay_secs", 5)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Solana defaults
            .set_default("solana.rpc_url", "https://api.mainnet-beta.solana.com")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SOLBOT_*)
            .add_source(
                Environment::with_prefix("SOLBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} pair={} paper={} threshold={:.2} risk={:.3} max_pos={}",
            self.bot.tag,
            self.tokens.pair(),
            self.bot.paper_trading,
            self.confluence.threshold,
            self.risk.risk_per_trade,
            self.risk.max_open_positions
        )
    }

    /// Validate required environment variables for live trading
    pub fn validate_env(&self) -> Result<()> {
        if self.bot.paper_trading {
            return Ok(());
        }
        if std::env::var("SOLANA_PRIVATE_KEY").is_err() {
            bail!("SOLANA_PRIVATE_KEY must be set for live trading");
        }
        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
