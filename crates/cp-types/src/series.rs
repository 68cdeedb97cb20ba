use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observed market price for a token.
///
/// Append-only: written once when observed, never mutated, removed only by
/// the retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub token: String,
    pub price: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub ts: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl PricePoint {
    pub fn new(token: &str, price: f64, volume_24h: f64, market_cap: f64) -> Self {
        let now = Utc::now();
        Self {
            token: token.to_string(),
            price,
            volume_24h,
            market_cap,
            ts: now,
            received_at: now,
        }
    }
}

/// A sentiment observation aggregated from one or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentSample {
    pub source: String,
    pub content: String,
    /// Score in [-1, 1]; negative is bearish, positive bullish.
    pub score: f64,
    pub metadata: serde_json::Value,
    pub ts: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl SentimentSample {
    pub fn new(source: &str, content: &str, score: f64, metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            source: source.to_string(),
            content: content.to_string(),
            score,
            metadata,
            ts: now,
            received_at: now,
        }
    }
}

/// A notable risk observation for a protocol.
///
/// Retained longer than the market series (regulatory-style audit trail).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub event_type: String,
    pub protocol: String,
    /// Score in [0, 100]; higher is riskier.
    pub risk_score: f64,
    pub description: String,
    pub metadata: serde_json::Value,
    pub ts: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        event_type: &str,
        protocol: &str,
        risk_score: f64,
        description: &str,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_type: event_type.to_string(),
            protocol: protocol.to_string(),
            risk_score,
            description: description.to_string(),
            metadata,
            ts: now,
            received_at: now,
        }
    }
}

/// Total value locked for a protocol on a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvlPoint {
    pub protocol: String,
    pub chain: String,
    pub tvl: f64,
    pub ts: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl TvlPoint {
    pub fn new(protocol: &str, chain: &str, tvl: f64) -> Self {
        let now = Utc::now();
        Self {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
            tvl,
            ts: now,
            received_at: now,
        }
    }
}

/// Classification of a risk score into coarse operator-facing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Bucket a [0, 100] risk score: low < 30 <= medium < 70 <= high.
    pub fn from_score(score: f64) -> Self {
        if score < 30.0 {
            RiskLevel::Low
        } else if score < 70.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}
