//! Health monitor — periodic concurrent probes of every dependency.
//!
//! Each cycle probes storage, the response cache, and every configured
//! external endpoint. Probes are independently timed and independently
//! fallible; the cycle joins them all before replacing the published
//! snapshot, so readers always see a complete, consistent picture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use cp_resilience::ResponseCache;
use cp_store::MonitorStore;
use cp_types::health::{HealthSnapshot, ServiceHealth, ServiceStatus};

/// One external HTTP dependency to probe each cycle.
#[derive(Debug, Clone)]
pub struct ExternalEndpoint {
    pub name: String,
    pub url: String,
}

impl ExternalEndpoint {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// Deadline for each individual probe; a hung dependency costs one probe
    /// slot, never the whole cycle.
    pub probe_timeout: Duration,
    pub external_endpoints: Vec<ExternalEndpoint>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            external_endpoints: vec![ExternalEndpoint::new(
                "external_apis",
                "https://api.coingecko.com/api/v3/ping",
            )],
        }
    }
}

/// Periodic dependency prober with a lock-free read path for the last
/// completed snapshot.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    store: Arc<MonitorStore>,
    cache: Arc<ResponseCache>,
    http: reqwest::Client,
    snapshot: RwLock<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        store: Arc<MonitorStore>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            store,
            cache,
            http,
            snapshot: RwLock::new(HealthSnapshot::empty()),
        }
    }

    /// Last completed cycle's snapshot. Never waits on an in-flight cycle.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.snapshot.read().clone()
    }

    async fn probe_storage(&self) -> ServiceHealth {
        let started = Instant::now();

        if self.store.is_closed() {
            return ServiceHealth::new("storage", ServiceStatus::Unhealthy, 0.0)
                .with_details(json!({"error": "storage pool not initialized"}));
        }

        match tokio::time::timeout(self.config.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed().as_secs_f64();
                ServiceHealth::new("storage", ServiceStatus::Healthy, elapsed).with_details(
                    json!({
                        "pool_size": self.store.pool_size(),
                        "pool_available": self.store.pool_available(),
                    }),
                )
            }
            Ok(Err(e)) => {
                ServiceHealth::new("storage", ServiceStatus::Unhealthy, started.elapsed().as_secs_f64())
                    .with_details(json!({"error": e.to_string()}))
            }
            Err(_) => ServiceHealth::new(
                "storage",
                ServiceStatus::Unhealthy,
                started.elapsed().as_secs_f64(),
            )
            .with_details(json!({"error": "probe timed out"})),
        }
    }

    async fn probe_cache(&self) -> ServiceHealth {
        let started = Instant::now();

        if self.cache.ping() {
            ServiceHealth::new("cache", ServiceStatus::Healthy, started.elapsed().as_secs_f64())
                .with_details(json!({"entries": self.cache.len()}))
        } else {
            // Cache misbehaving degrades responses (recompute on every call)
            // but does not take the system down.
            ServiceHealth::new("cache", ServiceStatus::Degraded, started.elapsed().as_secs_f64())
                .with_details(json!({"error": "cache unavailable, responses recomputed"}))
        }
    }

    async fn probe_endpoint(&self, endpoint: &ExternalEndpoint) -> ServiceHealth {
        let started = Instant::now();

        let result = self.http.get(&endpoint.url).send().await;
        let elapsed = started.elapsed().as_secs_f64();

        match result.and_then(|r| r.error_for_status()) {
            Ok(_) => ServiceHealth::new(&endpoint.name, ServiceStatus::Healthy, elapsed)
                .with_details(json!({"endpoint": endpoint.url})),
            Err(e) => ServiceHealth::new(&endpoint.name, ServiceStatus::Unhealthy, elapsed)
                .with_details(json!({"endpoint": endpoint.url, "error": e.to_string()})),
        }
    }

    /// Run one full probe cycle and publish the resulting snapshot.
    pub async fn run_cycle(&self) {
        let endpoint_probes = join_all(
            self.config
                .external_endpoints
                .iter()
                .map(|endpoint| self.probe_endpoint(endpoint)),
        );

        let (storage, cache, endpoints) =
            tokio::join!(self.probe_storage(), self.probe_cache(), endpoint_probes);

        let mut checks = vec![storage, cache];
        checks.extend(endpoints);

        for check in &checks {
            info!(
                service = %check.service,
                status = ?check.status,
                response_time = check.response_time,
                "health check"
            );
        }

        *self.snapshot.write() = HealthSnapshot::from_checks(checks);
    }

    /// Probe loop. Exits after the current cycle when `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(interval_secs = self.config.interval.as_secs(), "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("health monitor stopped");
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn monitor_with_endpoints(endpoints: Vec<ExternalEndpoint>) -> HealthMonitor {
        let store = Arc::new(MonitorStore::open_in_memory().await.unwrap());
        let cache = Arc::new(ResponseCache::new());
        HealthMonitor::new(
            HealthMonitorConfig {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
                external_endpoints: endpoints,
            },
            store,
            cache,
        )
    }

    #[tokio::test]
    async fn snapshot_before_first_cycle_is_empty_and_healthy() {
        let monitor = monitor_with_endpoints(vec![]).await;
        let snap = monitor.health_snapshot();
        assert_eq!(snap.overall_status, ServiceStatus::Healthy);
        assert!(snap.services.is_empty());
    }

    #[tokio::test]
    async fn cycle_probes_storage_and_cache() {
        let monitor = monitor_with_endpoints(vec![]).await;
        monitor.run_cycle().await;

        let snap = monitor.health_snapshot();
        assert_eq!(snap.overall_status, ServiceStatus::Healthy);
        assert_eq!(snap.services.len(), 2);
        assert_eq!(snap.services["storage"].status, ServiceStatus::Healthy);
        assert_eq!(snap.services["cache"].status, ServiceStatus::Healthy);
        assert_eq!(snap.services["storage"].details["pool_size"], 4);
    }

    #[tokio::test]
    async fn closed_storage_reports_unhealthy_with_detail() {
        let store = Arc::new(MonitorStore::open_in_memory().await.unwrap());
        store.close();
        let monitor = HealthMonitor::new(
            HealthMonitorConfig {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
                external_endpoints: vec![],
            },
            store,
            Arc::new(ResponseCache::new()),
        );

        monitor.run_cycle().await;
        let snap = monitor.health_snapshot();
        assert_eq!(snap.overall_status, ServiceStatus::Unhealthy);
        assert_eq!(snap.services["storage"].status, ServiceStatus::Unhealthy);
        assert!(snap.services["storage"].details["error"]
            .as_str()
            .unwrap()
            .contains("not initialized"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_unhealthy_without_stalling_others() {
        // Reserved TEST-NET-1 address: connection fails fast or times out.
        let monitor = monitor_with_endpoints(vec![ExternalEndpoint::new(
            "external_apis",
            "http://192.0.2.1:9/ping",
        )])
        .await;

        monitor.run_cycle().await;
        let snap = monitor.health_snapshot();
        assert_eq!(snap.services["external_apis"].status, ServiceStatus::Unhealthy);
        // The other probes still completed and published.
        assert_eq!(snap.services["storage"].status, ServiceStatus::Healthy);
        assert_eq!(snap.overall_status, ServiceStatus::Unhealthy);
    }
}
