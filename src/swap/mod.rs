//! Swap execution via the Jupiter aggregator
//!
//! Narrow quote/execute interface over Jupiter v6. Live execution signs the
//! serialized transaction returned by the swap endpoint with the configured
//! keypair and submits it over JSON-RPC. In paper mode, execution is a
//! deterministic simulation: the quote's stated output amount is used
//! unmodified and no network call is made.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::JupiterConfig;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("quote request failed: {0}")]
    Quote(String),
    #[error("swap request failed: {0}")]
    Swap(String),
    #[error("transaction signing failed: {0}")]
    Signing(String),
    #[error("rpc submission failed: {0}")]
    Rpc(String),
}

/// A swap route quoted by the aggregator
#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub input_mint: String,
    pub output_mint: String,
    /// Input amount in the input token's smallest unit
    pub in_amount: u64,
    /// Output amount in the output token's smallest unit
    pub out_amount: u64,
    pub price_impact_pct: f64,
    /// Raw quote response, passed through verbatim to the swap endpoint
    pub raw: serde_json::Value,
}

/// External quote/execute collaborator
#[async_trait]
pub trait SwapVenue: Send + Sync {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<SwapQuote, SwapError>;

    /// Execute a quoted swap, returning the transaction id
    async fn execute(&self, quote: &SwapQuote) -> Result<String, SwapError>;
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    #[serde(rename = "swapTransaction")]
    swap_transaction: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Jupiter v6 aggregator client
pub struct JupiterVenue {
    client: reqwest::Client,
    quote_url: String,
    swap_url: String,
    rpc_url: String,
    /// Simulate execution instead of touching the chain
    paper: bool,
}

impl JupiterVenue {
    pub fn new(config: &JupiterConfig, rpc_url: &str, paper: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            quote_url: config.quote_url.clone(),
            swap_url: config.swap_url.clone(),
            rpc_url: rpc_url.to_string(),
            paper,
        }
    }

    /// Deterministic paper fill: synthetic tx id, quoted amount unmodified
    pub fn simulate_tx_id(quote: &SwapQuote) -> String {
        let mint8: String = quote.output_mint.chars().take(8).collect();
        format!("PAPER_{}_{}", chrono::Utc::now().timestamp(), mint8)
    }

    fn keypair_from_env() -> Result<Keypair, SwapError> {
        let key = std::env::var("SOLANA_PRIVATE_KEY")
            .map_err(|_| SwapError::Signing("SOLANA_PRIVATE_KEY not configured".into()))?;
        let bytes = bs58::decode(key.trim())
            .into_vec()
            .map_err(|e| SwapError::Signing(format!("invalid base58 key: {e}")))?;
        Keypair::from_bytes(&bytes)
            .map_err(|e| SwapError::Signing(format!("invalid keypair bytes: {e}")))
    }

    /// Sign the serialized transaction from the swap endpoint and submit it
    /// via `sendTransaction`.
    async fn sign_and_send(&self, swap_transaction: &str) -> Result<String, SwapError> {
        let keypair = Self::keypair_from_env()?;

        let raw_tx = BASE64
            .decode(swap_transaction)
            .map_err(|e| SwapError::Signing(format!("transaction decode failed: {e}")))?;
        let mut tx: VersionedTransaction = bincode::deserialize(&raw_tx)
            .map_err(|e| SwapError::Signing(format!("transaction deserialize failed: {e}")))?;

        let message_bytes = tx.message.serialize();
        let signature = keypair.sign_message(&message_bytes);
        if tx.signatures.is_empty() {
            tx.signatures.push(signature);
        } else {
            tx.signatures[0] = signature;
        }

        let signed = bincode::serialize(&tx)
            .map_err(|e| SwapError::Signing(format!("transaction serialize failed: {e}")))?;
        let encoded = BASE64.encode(signed);

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [encoded, {"encoding": "base64", "skipPreflight": false, "maxRetries": 3}],
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SwapError::Rpc(e.to_string()))?;
        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| SwapError::Rpc(format!("bad rpc response: {e}")))?;

        if let Some(err) = rpc.error {
            return Err(SwapError::Rpc(err.to_string()));
        }
        rpc.result
            .ok_or_else(|| SwapError::Rpc("rpc returned no signature".into()))
    }
}

#[async_trait]
impl SwapVenue for JupiterVenue {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<SwapQuote, SwapError> {
        let params = [
            ("inputMint", input_mint.to_string()),
            ("outputMint", output_mint.to_string()),
            ("amount", amount.to_string()),
            ("slippageBps", slippage_bps.to_string()),
            ("onlyDirectRoutes", "false".to_string()),
            ("asLegacyTransaction", "false".to_string()),
        ];

        let response = self
            .client
            .get(&self.quote_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| SwapError::Quote(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SwapError::Quote(format!("{status}: {text}")));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SwapError::Quote(format!("bad quote response: {e}")))?;

        let in_amount = raw
            .get("inAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| SwapError::Quote("missing inAmount".into()))?;
        let out_amount = raw
            .get("outAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| SwapError::Quote("missing outAmount".into()))?;
        let price_impact_pct = raw
            .get("priceImpactPct")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        debug!(
            in_amount,
            out_amount, price_impact_pct, "Jupiter quote received"
        );

        Ok(SwapQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount,
            out_amount,
            price_impact_pct,
            raw,
        })
    }

    async fn execute(&self, quote: &SwapQuote) -> Result<String, SwapError> {
        if self.paper {
            let tx_id = Self::simulate_tx_id(quote);
            info!(
                in_amount = quote.in_amount,
                out_amount = quote.out_amount,
                tx = %tx_id,
                "[PAPER] Swap simulated"
            );
            return Ok(tx_id);
        }

        let keypair = Self::keypair_from_env()?;
        let swap_request = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": keypair.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
            "prioritizationFeeLamports": "auto",
        });

        let response = self
            .client
            .post(&self.swap_url)
            .json(&swap_request)
            .send()
            .await
            .map_err(|e| SwapError::Swap(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SwapError::Swap(format!("{status}: {text}")));
        }

        let swap: SwapResponse = response
            .json()
            .await
            .map_err(|e| SwapError::Swap(format!("bad swap response: {e}")))?;

        let tx_id = self.sign_and_send(&swap.swap_transaction).await?;
        info!(tx = %tx_id, "Swap executed");
        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_quote(out_amount: u64) -> SwapQuote {
        SwapQuote {
            input_mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
            output_mint: "So11111111111111111111111111111111111111112".into(),
            in_amount: 10_000_000,
            out_amount,
            price_impact_pct: 0.01,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn test_paper_tx_id_shape() {
        let quote = dummy_quote(50_000_000_000);
        let tx = JupiterVenue::simulate_tx_id(&quote);
        assert!(tx.starts_with("PAPER_"));
        assert!(tx.ends_with("So111111"));
    }

    #[tokio::test]
    async fn test_paper_execute_passes_quote_through() {
        let config = crate::config::AppConfig::load().unwrap();
        let venue = JupiterVenue::new(&config.jupiter, &config.solana.rpc_url, true);
        let quote = dummy_quote(123_456);
        let tx = venue.execute(&quote).await.expect("paper execute");
        assert!(tx.starts_with("PAPER_"));
        // The quote's out_amount is what the caller books, unmodified
        assert_eq!(quote.out_amount, 123_456);
    }

    #[test]
    fn test_missing_key_is_a_signing_error() {
        std::env::remove_var("SOLANA_PRIVATE_KEY");
        let err = JupiterVenue::keypair_from_env().unwrap_err();
        assert!(matches!(err, SwapError::Signing(_)));
    }
}
