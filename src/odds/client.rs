//! HTTP client for the odds provider.
//!
//! Read-only: settlement asks for match state and settled results, nothing
//! else. Transient failures are retried here with exponential backoff; what
//! still fails bubbles up so the queue layer can retry the whole job later.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::results::{MarketResults, MatchState};
use crate::models::MarketType;

const MAX_RETRIES: u32 = 3;

/// Seam for settlement: anything that can report match state and results.
#[async_trait]
pub trait OddsApi: Send + Sync {
    async fn match_state(&self, match_id: &str) -> Result<MatchState>;
    async fn market_results(
        &self,
        match_id: &str,
        market_type: MarketType,
    ) -> Result<MarketResults>;
}

pub struct OddsProviderClient {
    client: reqwest::Client,
    base_url: String,
}

impl OddsProviderClient {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(5));

        if let Some(api_key) = api_key {
            let mut headers = reqwest::header::HeaderMap::new();
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                auth_value.parse().context("Invalid API key format")?,
            );
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET with exponential backoff retry, parsed straight into the typed
    /// shape.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut backoff = Duration::from_millis(100);

        for attempt in 1..=MAX_RETRIES {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("Failed to parse response from {}", url));
                    } else if status.as_u16() == 429 {
                        warn!("Rate limited (429) on attempt {}, backing off 5s", attempt);
                        sleep(Duration::from_secs(5)).await;
                    } else if status.is_server_error() {
                        warn!(
                            "Server error {} on attempt {}, backing off {}ms",
                            status,
                            attempt,
                            backoff.as_millis()
                        );
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(16));
                    } else {
                        // Client error - don't retry
                        let body = response.text().await.unwrap_or_default();
                        bail!("Odds API error {}: {}", status, body);
                    }
                }
                Err(e) => {
                    warn!("Request failed (attempt {}): {}", attempt, e);
                    if attempt < MAX_RETRIES {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(16));
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }

        bail!("Max retries exceeded for {}", url)
    }
}

#[async_trait]
impl OddsApi for OddsProviderClient {
    async fn match_state(&self, match_id: &str) -> Result<MatchState> {
        let url = format!("{}/v1/matches/{}/status", self.base_url, match_id);
        debug!("Fetching match state: {}", url);
        self.get_json(&url).await
    }

    async fn market_results(
        &self,
        match_id: &str,
        market_type: MarketType,
    ) -> Result<MarketResults> {
        let url = format!(
            "{}/v1/matches/{}/results?market_type={}",
            self.base_url,
            match_id,
            market_type.as_str()
        );
        debug!("Fetching market results: {}", url);
        let results: MarketResults = self.get_json(&url).await?;
        if results.market_type() != market_type {
            bail!(
                "Odds API returned {} results for a {} request",
                results.market_type().as_str(),
                market_type.as_str()
            );
        }
        Ok(results)
    }
}
