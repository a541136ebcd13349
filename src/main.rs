//! SolBot entry point
//!
//! Wires the candle source and swap venue to the trading bot and runs the
//! analysis loop until ctrl-c.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use solbot::bot::TradingBot;
use solbot::config::AppConfig;
use solbot::oracle::GeckoTerminalSource;
use solbot::swap::JupiterVenue;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    config.validate_env()?;
    info!(config = %config.digest(), "Configuration loaded");

    if config.bot.paper_trading {
        info!("Paper trading mode: swaps are simulated");
    } else {
        info!("LIVE trading mode");
    }

    let trade_mint = config
        .tokens
        .trade_mint()
        .unwrap_or_default()
        .to_string();
    let candle_source = Arc::new(GeckoTerminalSource::new(&config.price_data, &trade_mint));
    let venue = Arc::new(JupiterVenue::new(
        &config.jupiter,
        &config.solana.rpc_url,
        config.bot.paper_trading,
    ));

    let mut bot = TradingBot::new(config, candle_source, venue)?;
    bot.run().await
}
