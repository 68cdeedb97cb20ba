//! ChainPulse monitoring service.
//!
//! Wires the store, resilience layer, monitors, and producer loops together
//! and exposes the minimal control surface over HTTP:
//! `GET /health`, `GET /metrics`, `POST /cache/flush`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cp_monitor::{
    AlertEvaluator, AlertEvaluatorConfig, HealthMonitor, HealthMonitorConfig, LogNotifier,
    MetricsCollector, MetricsCollectorConfig, Notifier, WebhookNotifier,
};
use cp_resilience::{BreakerConfig, BreakerRegistry, ResilienceLayer, RetryPolicy};
use cp_store::{MonitorStore, PoolConfig, RetentionPolicy};
use cp_realtime::{
    BroadcastHub, CoinGeckoFeed, DefiLlamaFeed, OrchestratorConfig, RealtimeOrchestrator,
    SimulatedRiskModel, SimulatedSentiment,
};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn breaker_registry() -> BreakerRegistry {
    let registry = BreakerRegistry::new();
    registry.register(
        "coingecko",
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        },
    );
    registry.register(
        "sentiment",
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
        },
    );
    registry.register(
        "defillama",
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(120),
        },
    );
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = env_or("CHAINPULSE_ADDR", "0.0.0.0:8090");
    let db_path = match std::env::var("CHAINPULSE_DB") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => {
            let dir = std::env::temp_dir().join("chainpulse");
            std::fs::create_dir_all(&dir)?;
            dir.join("chainpulse.db")
        }
    };

    let store = Arc::new(MonitorStore::open(&db_path, PoolConfig::default()).await?);
    info!(path = %db_path.display(), "store opened");

    let resilience = Arc::new(ResilienceLayer::new(RetryPolicy::default(), breaker_registry()));
    let hub = Arc::new(BroadcastHub::new());

    // Alert channels: webhook primary with log escalation when configured,
    // log only otherwise.
    let (notifier, escalation): (Arc<dyn Notifier>, Option<Arc<dyn Notifier>>) =
        match std::env::var("CHAINPULSE_WEBHOOK_URL") {
            Ok(url) => (
                Arc::new(WebhookNotifier::new(&url)),
                Some(Arc::new(LogNotifier)),
            ),
            Err(_) => (Arc::new(LogNotifier), None),
        };

    let health = Arc::new(HealthMonitor::new(
        HealthMonitorConfig::default(),
        store.clone(),
        resilience.cache().clone(),
    ));
    let metrics = Arc::new(MetricsCollector::new(MetricsCollectorConfig::default()));
    let evaluator = Arc::new(AlertEvaluator::new(
        AlertEvaluatorConfig::default(),
        metrics.clone(),
        health.clone(),
        notifier.clone(),
        escalation,
    ));

    let orchestrator = Arc::new(RealtimeOrchestrator::new(
        OrchestratorConfig::default(),
        resilience.clone(),
        store.clone(),
        hub.clone(),
        Arc::new(CoinGeckoFeed::new()),
        Arc::new(SimulatedSentiment),
        Arc::new(SimulatedRiskModel),
        Arc::new(DefiLlamaFeed::new()),
        notifier,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = orchestrator.clone().spawn(shutdown_rx.clone());
    {
        let health = health.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { health.run(rx).await }));
    }
    {
        let metrics = metrics.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { metrics.run(rx).await }));
    }
    {
        let evaluator = evaluator.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { evaluator.run(rx).await }));
    }
    // Hourly retention sweep.
    {
        let store = store.clone();
        let mut rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.cleanup(&RetentionPolicy::default()).await {
                            Ok(report) => info!(removed = report.total(), "retention sweep"),
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "ChainPulse control endpoint listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                let health = health.clone();
                let metrics = metrics.clone();
                let resilience = resilience.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_request(socket, health, metrics, resilience).await {
                        warn!(error = %e, "control request failed");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task join failed");
        }
    }
    store.close();
    info!("ChainPulse stopped");

    Ok(())
}

async fn handle_request(
    mut socket: tokio::net::TcpStream,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    resilience: Arc<ResilienceLayer>,
) -> anyhow::Result<()> {
    let mut buffer = [0u8; 1024];
    let read = socket.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..read]);
    let request_line = request.lines().next().unwrap_or_default();

    let (status, body) = match request_line {
        line if line.starts_with("GET /health") => (
            "200 OK",
            serde_json::to_string(&health.health_snapshot())?,
        ),
        line if line.starts_with("GET /metrics") => match metrics.summary() {
            Some(summary) => ("200 OK", serde_json::to_string(&summary)?),
            None => ("200 OK", r#"{"error":"no metrics available"}"#.to_string()),
        },
        line if line.starts_with("POST /cache/flush") => {
            let flushed = resilience.flush_cache();
            (
                "200 OK",
                format!(r#"{{"status":"ok","flushed":{flushed}}}"#),
            )
        }
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}
