//! HTTP market data adapter.
//!
//! Talks to a broker-style quote gateway:
//! - `GET {base}/v1/spot?symbol=NIFTY` -> `{"symbol": "NIFTY", "ltp": 26150.5}`
//! - `GET {base}/v1/option-chain?symbol=NIFTY&strikes=26100,26150`
//!   -> `{"quotes": [{"strike": 26100, "call_ltp": .., "put_ltp": .., "call_oi": .., "put_oi": ..}]}`
//!
//! Rate limits (429), server errors (5xx) and network failures are retried
//! with exponential backoff and surface as `FeedError::Transient` once
//! retries run out. Rejected credentials (401/403) are `FeedError::Fatal`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use super::{FeedError, MarketDataFeed};
use crate::config::FeedConfig;
use crate::types::StrikeQuote;

/// Base delay for exponential backoff (doubles each retry).
const BASE_BACKOFF_MS: u64 = 500;

/// Ceiling on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SpotResponse {
    #[allow(dead_code)]
    symbol: String,
    ltp: Decimal,
}

#[derive(Debug, Deserialize)]
struct ChainResponse {
    quotes: Vec<WireQuote>,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    strike: i64,
    #[serde(default)]
    call_ltp: Option<Decimal>,
    #[serde(default)]
    put_ltp: Option<Decimal>,
    #[serde(default)]
    call_oi: i64,
    #[serde(default)]
    put_oi: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RestQuoteFeed {
    http: Client,
    base_url: String,
    token: SecretString,
    underlying: String,
    max_retries: u32,
}

impl RestQuoteFeed {
    pub fn new(config: &FeedConfig, token: String, underlying: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build market data HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: SecretString::new(token),
            underlying: underlying.to_string(),
            max_retries: config.max_retries,
        })
    }

    fn spot_url(&self) -> String {
        format!(
            "{}/v1/spot?symbol={}",
            self.base_url,
            urlencoding::encode(&self.underlying)
        )
    }

    fn chain_url(&self, strikes: &BTreeSet<i64>) -> String {
        let list = strikes
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}/v1/option-chain?symbol={}&strikes={}",
            self.base_url,
            urlencoding::encode(&self.underlying),
            urlencoding::encode(&list)
        )
    }

    /// GET with retry + backoff.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay_ms(attempt);
                debug!(attempt, delay_ms = delay, "Retrying market data request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .get(url)
                .bearer_auth(self.token.expose_secret())
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            FeedError::Transient(format!("malformed response from {url}: {e}"))
                        });
                    }

                    let body = response.text().await.unwrap_or_default();
                    match classify_status(status) {
                        StatusClass::Retry => {
                            warn!(status = %status, attempt, error = %body, "Retryable market data error");
                            last_error = Some(format!("HTTP {status}: {body}"));
                            continue;
                        }
                        StatusClass::Fatal => {
                            return Err(FeedError::Fatal(format!("HTTP {status}: {body}")));
                        }
                        StatusClass::Reject => {
                            return Err(FeedError::Transient(format!("HTTP {status}: {body}")));
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Market data request failed");
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        Err(FeedError::Transient(format!(
            "market data failed after {} retries: {}",
            self.max_retries,
            last_error.unwrap_or_default()
        )))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Retry,
    Fatal,
    Reject,
}

fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        401 | 403 => StatusClass::Fatal,
        429 => StatusClass::Retry,
        s if s >= 500 => StatusClass::Retry,
        _ => StatusClass::Reject,
    }
}

/// Convert wire quotes, dropping strikes the gateway sent without prices.
fn into_quotes(resp: ChainResponse) -> HashMap<i64, StrikeQuote> {
    let now = Utc::now();
    resp.quotes
        .into_iter()
        .filter(|q| q.call_ltp.is_some() || q.put_ltp.is_some())
        .map(|q| {
            (
                q.strike,
                StrikeQuote {
                    strike: q.strike,
                    call_price: q.call_ltp.unwrap_or(Decimal::ZERO),
                    put_price: q.put_ltp.unwrap_or(Decimal::ZERO),
                    call_oi: q.call_oi,
                    put_oi: q.put_oi,
                    last_updated: now,
                },
            )
        })
        .collect()
}

/// Delay before retry `attempt` (1-based), capped at `MAX_BACKOFF_MS`.
fn backoff_delay_ms(attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| BASE_BACKOFF_MS.checked_mul(factor))
        .map_or(MAX_BACKOFF_MS, |delay| delay.min(MAX_BACKOFF_MS))
}

#[async_trait]
impl MarketDataFeed for RestQuoteFeed {
    async fn fetch_quotes(
        &self,
        strikes: &BTreeSet<i64>,
    ) -> Result<HashMap<i64, StrikeQuote>, FeedError> {
        if strikes.is_empty() {
            return Ok(HashMap::new());
        }
        let resp: ChainResponse = self.get_json(&self.chain_url(strikes)).await?;
        Ok(into_quotes(resp))
    }

    async fn fetch_spot(&self) -> Result<Decimal, FeedError> {
        let resp: SpotResponse = self.get_json(&self.spot_url()).await?;
        Ok(resp.ltp)
    }
}
