//! OHLCV candle source
//!
//! Fetches candles from the GeckoTerminal pool API (free, no key) with a
//! DexScreener price fallback. The trait keeps the bot testable offline; a
//! fetch may return fewer candles than requested, or an error the caller
//! treats as "skip this cycle".

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PriceDataConfig;
use crate::types::Candle;

const GECKO_BASE_URL: &str = "https://api.geckoterminal.com/api/v2";
const DEXSCREENER_URL: &str = "https://api.dexscreener.com/tokens/v1/solana";

/// GeckoTerminal timeframe path + aggregate for a label like "5m" or "1h"
fn gecko_tf_params(label: &str) -> Option<(&'static str, u32)> {
    match label {
        "1m" => Some(("minute", 1)),
        "5m" => Some(("minute", 5)),
        "15m" => Some(("minute", 15)),
        "30m" => Some(("minute", 30)),
        "1h" => Some(("hour", 1)),
        "4h" => Some(("hour", 4)),
        "1d" => Some(("day", 1)),
        "1w" => Some(("day", 7)),
        _ => None,
    }
}

/// External candle/price collaborator
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch up to `limit` candles for a timeframe label, ascending by
    /// timestamp. May return fewer than requested.
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Current price of the traded token in the quote currency
    async fn current_price(&self) -> Result<f64>;
}

/// Parse GeckoTerminal's `ohlcv_list` ([[ts, o, h, l, c, v], ...]) into
/// candles, skipping malformed rows, ascending by timestamp.
pub fn parse_ohlcv_list(response: &serde_json::Value) -> Vec<Candle> {
    let rows = match response
        .pointer("/data/attributes/ohlcv_list")
        .and_then(|v| v.as_array())
    {
        Some(rows) => rows,
        None => return Vec::new(),
    };

    let mut candles: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            if row.len() < 6 {
                return None;
            }
            Some(Candle {
                ts: row[0].as_i64()?,
                open: row[1].as_f64()?,
                high: row[2].as_f64()?,
                low: row[3].as_f64()?,
                close: row[4].as_f64()?,
                volume: row[5].as_f64()?,
            })
        })
        .collect();
    candles.sort_by_key(|c| c.ts);
    candles
}

/// First pair's `priceUsd` from a DexScreener token response
pub fn parse_dexscreener_price(response: &serde_json::Value) -> Option<f64> {
    response
        .as_array()?
        .first()?
        .get("priceUsd")?
        .as_str()?
        .parse()
        .ok()
}

/// `base_token_price_usd` from a GeckoTerminal pool response
pub fn parse_gecko_pool_price(response: &serde_json::Value) -> Option<f64> {
    response
        .pointer("/data/attributes/base_token_price_usd")?
        .as_str()?
        .parse()
        .ok()
}

/// GeckoTerminal-backed candle source
pub struct GeckoTerminalSource {
    client: reqwest::Client,
    pool_address: String,
    trade_mint: String,
}

impl GeckoTerminalSource {
    pub fn new(config: &PriceDataConfig, trade_mint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            pool_address: config.gecko_pool_address.clone(),
            trade_mint: trade_mint.to_string(),
        }
    }

    async fn fetch_gecko_price(&self) -> Result<f64> {
        let url = format!(
            "{}/networks/solana/pools/{}",
            GECKO_BASE_URL, self.pool_address
        );
        let response: serde_json::Value = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("GeckoTerminal pool request failed")?
            .json()
            .await
            .context("GeckoTerminal pool response was not JSON")?;
        parse_gecko_pool_price(&response)
            .ok_or_else(|| anyhow::anyhow!("GeckoTerminal pool response missing price"))
    }

    async fn fetch_dexscreener_price(&self) -> Result<f64> {
        let url = format!("{}/{}", DEXSCREENER_URL, self.trade_mint);
        let response: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("DexScreener request failed")?
            .json()
            .await
            .context("DexScreener response was not JSON")?;
        parse_dexscreener_price(&response)
            .ok_or_else(|| anyhow::anyhow!("DexScreener response missing price"))
    }
}

#[async_trait]
impl CandleSource for GeckoTerminalSource {
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        let (tf_path, aggregate) = match gecko_tf_params(timeframe) {
            Some(params) => params,
            None => bail!("Unsupported timeframe label: {timeframe}"),
        };
        // GeckoTerminal caps at 1000 candles per request
        let limit = limit.min(1000);

        let url = format!(
            "{}/networks/solana/pools/{}/ohlcv/{}",
            GECKO_BASE_URL, self.pool_address, tf_path
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("aggregate", aggregate.to_string()),
                ("limit", limit.to_string()),
                ("currency", "usd".to_string()),
            ])
            .send()
            .await
            .context("GeckoTerminal OHLCV request failed")?;

        if !response.status().is_success() {
            bail!("GeckoTerminal OHLCV returned {}", response.status());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("GeckoTerminal OHLCV response was not JSON")?;
        let candles = parse_ohlcv_list(&body);
        debug!(timeframe, count = candles.len(), "Candles received");
        Ok(candles)
    }

    /// DexScreener first (generous rate limit), then the GeckoTerminal
    /// pool price, then the last 1m candle close.
    async fn current_price(&self) -> Result<f64> {
        match self.fetch_dexscreener_price().await {
            Ok(price) if price > 0.0 => return Ok(price),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "DexScreener price unavailable"),
        }
        match self.fetch_gecko_price().await {
            Ok(price) if price > 0.0 => return Ok(price),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "GeckoTerminal price unavailable"),
        }
        let candles = self.fetch_ohlcv("1m", 5).await?;
        match candles.last() {
            Some(c) if c.close > 0.0 => Ok(c.close),
            _ => bail!("No price source available"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ohlcv_list_sorted_and_filtered() {
        let body = json!({
            "data": {
                "attributes": {
                    "ohlcv_list": [
                        [1700000600, 101.0, 102.0, 100.5, 101.5, 2000.0],
                        [1700000300, 100.0, 101.0, 99.5, 100.8, 1500.0],
                        ["bad row"],
                        [1700000900, 101.5, 103.0, 101.0, 102.5],
                    ]
                }
            }
        });
        let candles = parse_ohlcv_list(&body);
        assert_eq!(candles.len(), 2);
        assert!(candles[0].ts < candles[1].ts);
        assert_eq!(candles[0].close, 100.8);
    }

    #[test]
    fn test_parse_ohlcv_list_empty_or_missing() {
        assert!(parse_ohlcv_list(&json!({})).is_empty());
        assert!(parse_ohlcv_list(&json!({"data": {"attributes": {}}})).is_empty());
    }

    #[test]
    fn test_parse_dexscreener_price() {
        let body = json!([{"priceUsd": "142.35", "chainId": "solana"}]);
        assert_eq!(parse_dexscreener_price(&body), Some(142.35));
        assert_eq!(parse_dexscreener_price(&json!([])), None);
        assert_eq!(parse_dexscreener_price(&json!({})), None);
    }

    #[test]
    fn test_parse_gecko_pool_price() {
        let body = json!({"data": {"attributes": {"base_token_price_usd": "141.9"}}});
        assert_eq!(parse_gecko_pool_price(&body), Some(141.9));
        assert_eq!(parse_gecko_pool_price(&json!({})), None);
    }

    #[test]
    fn test_timeframe_label_mapping() {
        assert_eq!(gecko_tf_params("5m"), Some(("minute", 5)));
        assert_eq!(gecko_tf_params("1h"), Some(("hour", 1)));
        assert_eq!(gecko_tf_params("3h"), None);
    }
}
