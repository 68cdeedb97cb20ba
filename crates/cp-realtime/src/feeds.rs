//! Upstream data feeds.
//!
//! Traits describe what the orchestrator needs; implementations are either
//! thin HTTP clients or simulated stand-ins for the external forecasting
//! models, which are out of scope and only expose a score plus metadata.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::warn;

use cp_types::forecast::ForecastScore;
use cp_types::series::{PricePoint, TvlPoint};

/// Source of latest market prices for a set of tokens.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Breaker name for this dependency.
    fn name(&self) -> &str;

    async fn latest_prices(&self, tokens: &[String]) -> anyhow::Result<Vec<PricePoint>>;
}

/// External forecast model: one opaque score per entity.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Breaker name for this dependency.
    fn name(&self) -> &str;

    async fn compute(&self, entity: &str) -> anyhow::Result<ForecastScore>;
}

/// Source of total-value-locked observations per protocol.
#[async_trait]
pub trait TvlFeed: Send + Sync {
    /// Breaker name for this dependency.
    fn name(&self) -> &str;

    async fn protocol_tvls(&self, protocols: &[String]) -> anyhow::Result<Vec<TvlPoint>>;
}

/// CoinGecko simple-price client.
#[derive(Debug)]
pub struct CoinGeckoFeed {
    base_url: String,
    client: reqwest::Client,
}

impl CoinGeckoFeed {
    pub fn new() -> Self {
        Self::with_base_url("https://api.coingecko.com/api/v3")
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for CoinGeckoFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceFeed for CoinGeckoFeed {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn latest_prices(&self, tokens: &[String]) -> anyhow::Result<Vec<PricePoint>> {
        let mut points = Vec::with_capacity(tokens.len());

        for token in tokens {
            let response = self
                .client
                .get(format!("{}/simple/price", self.base_url))
                .query(&[
                    ("ids", token.as_str()),
                    ("vs_currencies", "usd"),
                    ("include_24hr_vol", "true"),
                    ("include_market_cap", "true"),
                ])
                .send()
                .await?
                .error_for_status()?;

            let body: serde_json::Value = response.json().await?;
            let Some(entry) = body.get(token) else {
                // Unknown token id: skip it, keep the rest of the batch.
                warn!(token = %token, "no price returned");
                continue;
            };

            let price = entry["usd"].as_f64().unwrap_or(0.0);
            let volume_24h = entry["usd_24h_vol"].as_f64().unwrap_or(0.0);
            let market_cap = entry["usd_market_cap"].as_f64().unwrap_or(0.0);
            points.push(PricePoint::new(token, price, volume_24h, market_cap));
        }

        Ok(points)
    }
}

/// DefiLlama aggregate-TVL client.
#[derive(Debug)]
pub struct DefiLlamaFeed {
    base_url: String,
    client: reqwest::Client,
}

impl DefiLlamaFeed {
    pub fn new() -> Self {
        Self::with_base_url("https://api.llama.fi")
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for DefiLlamaFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TvlFeed for DefiLlamaFeed {
    fn name(&self) -> &str {
        "defillama"
    }

    async fn protocol_tvls(&self, protocols: &[String]) -> anyhow::Result<Vec<TvlPoint>> {
        let mut points = Vec::with_capacity(protocols.len());

        for protocol in protocols {
            let response = self
                .client
                .get(format!("{}/tvl/{}", self.base_url, protocol))
                .send()
                .await?
                .error_for_status()?;

            // The endpoint returns a bare number.
            let tvl: f64 = response.json().await?;
            points.push(TvlPoint::new(protocol, "aggregate", tvl));
        }

        Ok(points)
    }
}

/// Simulated aggregate sentiment, standing in for the external sentiment
/// model. Produces an overall score in [-1, 1] with a per-source breakdown.
#[derive(Debug, Default)]
pub struct SimulatedSentiment;

#[async_trait]
impl ForecastProvider for SimulatedSentiment {
    fn name(&self) -> &str {
        "sentiment"
    }

    async fn compute(&self, _entity: &str) -> anyhow::Result<ForecastScore> {
        let mut rng = rand::rng();
        let overall: f64 = rng.random_range(-1.0..1.0);
        let sources = json!([
            {
                "source": "twitter",
                "sentiment": rng.random_range(-1.0..1.0),
                "volume": rng.random_range(100..1000),
            },
            {
                "source": "reddit",
                "sentiment": rng.random_range(-1.0..1.0),
                "volume": rng.random_range(50..500),
            },
        ]);

        Ok(ForecastScore::new(overall, json!({ "sources": sources })))
    }
}

/// Simulated composite risk model. Produces a [0, 100] score with a factor
/// breakdown per protocol.
#[derive(Debug, Default)]
pub struct SimulatedRiskModel;

#[async_trait]
impl ForecastProvider for SimulatedRiskModel {
    fn name(&self) -> &str {
        "risk_model"
    }

    async fn compute(&self, _entity: &str) -> anyhow::Result<ForecastScore> {
        let mut rng = rand::rng();
        let score: f64 = rng.random_range(0.0..100.0);
        let factors = json!([
            {"factor": "volatility", "impact": rng.random_range(0.0..1.0)},
            {"factor": "sentiment", "impact": rng.random_range(0.0..1.0)},
            {"factor": "liquidity", "impact": rng.random_range(0.0..1.0)},
        ]);

        Ok(ForecastScore::new(score, json!({ "factors": factors })))
    }
}
