//! The realtime producer loops.
//!
//! Four independently paced loops share one pattern: fetch through the
//! resilience layer, persist what was fetched, publish to live subscribers.
//! Persistence happens inside the guarded operation, so a cache hit replays
//! the publication without re-writing rows or re-raising alerts. Each loop
//! is its own failure domain — an iteration that errors is logged and the
//! loop keeps its cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cp_monitor::Notifier;
use cp_resilience::{cache_key, CallSpec, ResilienceLayer};
use cp_store::MonitorStore;
use cp_types::alert::{Alert, AlertSeverity};
use cp_types::errors::CpResult;
use cp_types::series::{RiskEvent, RiskLevel, SentimentSample, TvlPoint};

use crate::feeds::{ForecastProvider, PriceFeed, TvlFeed};
use crate::hub::{BroadcastHub, Envelope};

/// Configuration for the realtime orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base cadence; the sentiment, risk, and status loops run at 2x, 3x,
    /// and 4x this interval.
    pub update_interval: Duration,
    pub tokens: Vec<String>,
    pub protocols: Vec<String>,
    pub price_ttl: Duration,
    pub sentiment_ttl: Duration,
    pub risk_ttl: Duration,
    pub tvl_ttl: Duration,
    /// Per-attempt deadline for upstream calls.
    pub call_timeout: Duration,
    /// Risk scores at or above this persist an event and raise an alert.
    pub high_risk_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(30),
            tokens: vec![
                "ethereum".to_string(),
                "bitcoin".to_string(),
                "uniswap".to_string(),
                "aave".to_string(),
                "compound".to_string(),
            ],
            protocols: vec![
                "ethereum".to_string(),
                "uniswap".to_string(),
                "aave".to_string(),
                "compound".to_string(),
            ],
            price_ttl: Duration::from_secs(60),
            sentiment_ttl: Duration::from_secs(45),
            risk_ttl: Duration::from_secs(60),
            tvl_ttl: Duration::from_secs(300),
            call_timeout: Duration::from_secs(10),
            high_risk_threshold: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ProducerLoop {
    Price,
    Sentiment,
    Risk,
    Status,
}

/// Owns the producer loops and their collaborators.
pub struct RealtimeOrchestrator {
    config: OrchestratorConfig,
    resilience: Arc<ResilienceLayer>,
    store: Arc<MonitorStore>,
    hub: Arc<BroadcastHub>,
    prices: Arc<dyn PriceFeed>,
    sentiment: Arc<dyn ForecastProvider>,
    risk: Arc<dyn ForecastProvider>,
    tvl: Arc<dyn TvlFeed>,
    /// High-risk events go out through the same path as operational alerts.
    notifier: Arc<dyn Notifier>,
}

impl RealtimeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        resilience: Arc<ResilienceLayer>,
        store: Arc<MonitorStore>,
        hub: Arc<BroadcastHub>,
        prices: Arc<dyn PriceFeed>,
        sentiment: Arc<dyn ForecastProvider>,
        risk: Arc<dyn ForecastProvider>,
        tvl: Arc<dyn TvlFeed>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            resilience,
            store,
            hub,
            prices,
            sentiment,
            risk,
            tvl,
            notifier,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    // ---- cycles -----------------------------------------------------------

    /// Fetch latest prices, persist them, broadcast a `price_update`.
    pub async fn price_cycle(&self) -> CpResult<()> {
        let token_refs: Vec<&str> = self.config.tokens.iter().map(|t| t.as_str()).collect();
        let spec = CallSpec::new(
            self.prices.name(),
            cache_key("price_data", &token_refs),
            self.config.price_ttl,
            self.config.call_timeout,
        );

        let feed = self.prices.clone();
        let store = self.store.clone();
        let tokens = self.config.tokens.clone();
        let points = self
            .resilience
            .call(&spec, move || {
                let feed = feed.clone();
                let store = store.clone();
                let tokens = tokens.clone();
                async move {
                    let points = feed.latest_prices(&tokens).await?;
                    for point in &points {
                        // Series data is lossy-tolerant: a dropped insert is
                        // logged, never fatal.
                        if let Err(e) = store.insert_price(point).await {
                            warn!(token = %point.token, error = %e, "price insert dropped");
                        }
                    }
                    Ok(points)
                }
            })
            .await?;

        let mut data = Map::new();
        for point in &points {
            data.insert(
                point.token.clone(),
                json!({
                    "price": point.price,
                    "volume_24h": point.volume_24h,
                    "market_cap": point.market_cap,
                    "timestamp": point.ts,
                }),
            );
        }

        let delivered = self
            .hub
            .publish(&Envelope::new("price_update", Value::Object(data)))
            .await;
        info!(tokens = points.len(), delivered, "price data broadcast");
        Ok(())
    }

    /// Compute aggregate sentiment, persist the sample, broadcast a
    /// `sentiment_update`.
    pub async fn sentiment_cycle(&self) -> CpResult<()> {
        let spec = CallSpec::new(
            self.sentiment.name(),
            cache_key("sentiment_data", &["aggregate"]),
            self.config.sentiment_ttl,
            self.config.call_timeout,
        );

        let provider = self.sentiment.clone();
        let store = self.store.clone();
        let sample = self
            .resilience
            .call(&spec, move || {
                let provider = provider.clone();
                let store = store.clone();
                async move {
                    let forecast = provider.compute("aggregate").await?;
                    let sample = SentimentSample::new(
                        "aggregated",
                        "Realtime sentiment aggregate",
                        forecast.score,
                        forecast.metadata,
                    );
                    if let Err(e) = store.insert_sentiment(&sample).await {
                        warn!(error = %e, "sentiment insert dropped");
                    }
                    Ok(sample)
                }
            })
            .await?;

        let delivered = self
            .hub
            .publish(&Envelope::new(
                "sentiment_update",
                json!({
                    "overall_sentiment": sample.score,
                    "sentiment_sources": sample.metadata["sources"],
                    "timestamp": sample.ts,
                }),
            ))
            .await;
        info!(score = sample.score, delivered, "sentiment data broadcast");
        Ok(())
    }

    /// Assess every configured protocol, persist and alert on high risk,
    /// broadcast a `risk_update`.
    pub async fn risk_cycle(&self) -> CpResult<()> {
        let mut data = Map::new();

        for protocol in &self.config.protocols {
            match self.assess_protocol(protocol).await {
                Ok(entry) => {
                    data.insert(protocol.clone(), entry);
                }
                Err(e) => {
                    // One protocol's failing model never blocks the rest.
                    warn!(protocol = %protocol, error = %e, "risk assessment skipped");
                }
            }
        }

        let delivered = self
            .hub
            .publish(&Envelope::new("risk_update", Value::Object(data)))
            .await;
        info!(delivered, "risk assessment broadcast");
        Ok(())
    }

    async fn assess_protocol(&self, protocol: &str) -> CpResult<Value> {
        let spec = CallSpec::new(
            self.risk.name(),
            cache_key("risk_data", &[protocol]),
            self.config.risk_ttl,
            self.config.call_timeout,
        );

        let provider = self.risk.clone();
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let entity = protocol.to_string();
        let threshold = self.config.high_risk_threshold;

        let (score, metadata) = self
            .resilience
            .call(&spec, move || {
                let provider = provider.clone();
                let store = store.clone();
                let notifier = notifier.clone();
                let entity = entity.clone();
                async move {
                    let forecast = provider.compute(&entity).await?;

                    if forecast.score >= threshold {
                        let event = RiskEvent::new(
                            "high_risk_alert",
                            &entity,
                            forecast.score,
                            &format!("High risk detected for {entity}"),
                            forecast.metadata.clone(),
                        );
                        if let Err(e) = store.insert_risk_event(&event).await {
                            warn!(protocol = %entity, error = %e, "risk event insert dropped");
                        }

                        let alert = Alert::new(
                            AlertSeverity::Critical,
                            &format!("High Risk Alert - {entity}"),
                            &format!(
                                "Risk score for {entity} is {:.1} (threshold: {threshold:.1})",
                                forecast.score
                            ),
                            forecast.metadata.clone(),
                        );
                        if let Err(e) = notifier.send(&alert).await {
                            warn!(protocol = %entity, error = %e, "risk alert delivery failed");
                        }
                    }

                    Ok((forecast.score, forecast.metadata))
                }
            })
            .await?;

        Ok(json!({
            "risk_score": score,
            "risk_level": RiskLevel::from_score(score),
            "factors": metadata["factors"],
            "timestamp": Utc::now(),
        }))
    }

    /// Refresh TVL observations and broadcast the aggregated
    /// `system_status`.
    pub async fn status_cycle(&self) -> CpResult<()> {
        let protocol_refs: Vec<&str> =
            self.config.protocols.iter().map(|p| p.as_str()).collect();
        let spec = CallSpec::new(
            self.tvl.name(),
            cache_key("tvl_data", &protocol_refs),
            self.config.tvl_ttl,
            self.config.call_timeout,
        );

        let feed = self.tvl.clone();
        let store = self.store.clone();
        let protocols = self.config.protocols.clone();
        let tvl_points: Vec<TvlPoint> = self
            .resilience
            .call(&spec, move || {
                let feed = feed.clone();
                let store = store.clone();
                let protocols = protocols.clone();
                async move {
                    let points = feed.protocol_tvls(&protocols).await?;
                    for point in &points {
                        if let Err(e) = store.insert_tvl(point).await {
                            warn!(protocol = %point.protocol, error = %e, "tvl insert dropped");
                        }
                    }
                    Ok(points)
                }
            })
            .await?;

        let stats = self.store.protocol_stats().await?;
        let tvl: Map<String, Value> = tvl_points
            .iter()
            .map(|p| (p.protocol.clone(), json!(p.tvl)))
            .collect();

        let delivered = self
            .hub
            .publish(&Envelope::new(
                "system_status",
                json!({
                    "status": "operational",
                    "timestamp": Utc::now(),
                    "stats": stats,
                    "tvl": tvl,
                }),
            ))
            .await;
        info!(delivered, "system status broadcast");
        Ok(())
    }

    // ---- loops ------------------------------------------------------------

    /// Spawn the four producer loops. Each exits after its current cycle
    /// when `shutdown` flips.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let base = self.config.update_interval;
        [
            (ProducerLoop::Price, base),
            (ProducerLoop::Sentiment, base * 2),
            (ProducerLoop::Risk, base * 3),
            (ProducerLoop::Status, base * 4),
        ]
        .into_iter()
        .map(|(kind, interval)| {
            let orchestrator = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                orchestrator.run_loop(kind, interval, shutdown).await;
            })
        })
        .collect()
    }

    async fn run_loop(
        &self,
        kind: ProducerLoop,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        info!(producer = ?kind, interval_secs = interval.as_secs(), "producer loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = match kind {
                        ProducerLoop::Price => self.price_cycle().await,
                        ProducerLoop::Sentiment => self.sentiment_cycle().await,
                        ProducerLoop::Risk => self.risk_cycle().await,
                        ProducerLoop::Status => self.status_cycle().await,
                    };
                    if let Err(e) = result {
                        error!(producer = ?kind, error = %e, "iteration failed, continuing");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(producer = ?kind, "producer loop stopped");
    }
}

impl std::fmt::Debug for RealtimeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeOrchestrator")
            .field("config", &self.config)
            .finish()
    }
}
