//! HTTP client for the external OHLC market-data API.
//!
//! Response shape is the CoinGecko OHLC endpoint: a JSON array of
//! `[timestamp_ms, open, high, low, close]` rows.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MarketDataConfig;

const USER_AGENT: &str = concat!("racebot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("market data API returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// One candle as returned by the external feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCandle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

pub struct MarketDataClient {
    http: reqwest::Client,
    config: MarketDataConfig,
}

impl MarketDataClient {
    pub fn new(config: MarketDataConfig) -> Result<Self, MarketDataError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { http, config })
    }

    /// Fetch OHLC candles for one asset. Transport and API errors propagate;
    /// market-data ingestion is a hard dependency of the cycle.
    pub async fn fetch_ohlc(
        &self,
        external_id: &str,
        vs_currency: &str,
    ) -> Result<Vec<ExternalCandle>, MarketDataError> {
        let url = format!(
            "{}/coins/{}/ohlc?vs_currency={}&days={}",
            self.config.base_url.trim_end_matches('/'),
            external_id.to_lowercase(),
            vs_currency.to_lowercase(),
            self.config.default_days,
        );

        info!(external_id, "Fetching OHLC data");

        let mut request = self.http.get(&url);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                warn!("Market data API rate limit exceeded");
            }
            return Err(MarketDataError::Api { status, body });
        }

        // Rows with fewer than five fields are malformed and skipped.
        let raw: Vec<Vec<Decimal>> = response.json().await?;
        let mut candles: Vec<ExternalCandle> = raw
            .into_iter()
            .filter(|row| row.len() >= 5)
            .filter_map(|row| {
                let millis = row[0].to_i64()?;
                let timestamp = Utc.timestamp_millis_opt(millis).single()?;
                Some(ExternalCandle {
                    timestamp,
                    open: row[1],
                    high: row[2],
                    low: row[3],
                    close: row[4],
                })
            })
            .collect();
        candles.sort_by_key(|c| c.timestamp);

        info!(external_id, count = candles.len(), "Fetched candles");

        Ok(candles)
    }
}
