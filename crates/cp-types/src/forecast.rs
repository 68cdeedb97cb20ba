use serde::{Deserialize, Serialize};

/// Output contract of an external forecast provider (volatility, sentiment,
/// liquidity, composite risk). The model itself is a black box; only the
/// score and whatever explanatory metadata it chooses to attach cross the
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastScore {
    pub score: f64,
    pub metadata: serde_json::Value,
}

impl ForecastScore {
    pub fn new(score: f64, metadata: serde_json::Value) -> Self {
        Self { score, metadata }
    }
}
