//! Threshold evaluation and alert delivery.
//!
//! The evaluator runs at twice the probe interval so transient blips settle
//! before they can page anyone. Repeated breaches re-alert every cycle by
//! design — cadence is the only throttle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cp_types::alert::{Alert, AlertSeverity};
use cp_types::errors::NotifyError;
use cp_types::health::{HealthSnapshot, ServiceStatus};
use cp_types::metrics::{AlertThresholds, SystemMetrics};

use crate::metrics::MetricsCollector;
use crate::monitor::HealthMonitor;

/// Delivery channel for alerts. Send is best-effort; the caller logs
/// failures and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Fallback notifier that writes alerts to the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            AlertSeverity::Critical => {
                error!(title = %alert.title, message = %alert.message, "ALERT")
            }
            AlertSeverity::Warning => {
                warn!(title = %alert.title, message = %alert.message, "ALERT")
            }
            AlertSeverity::Info => {
                info!(title = %alert.title, message = %alert.message, "ALERT")
            }
        }
        Ok(())
    }
}

/// Posts alerts to a chat webhook (Slack-compatible payload shape).
#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = json!({
            "text": format!("*{}*: {}", alert.title, alert.message),
            "severity": alert.severity,
            "metadata": alert.metadata,
        });

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NotifyError::DeliveryFailed {
                channel: "webhook".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Configuration for the alert evaluator.
#[derive(Debug, Clone)]
pub struct AlertEvaluatorConfig {
    /// Twice the probe interval by default.
    pub interval: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for AlertEvaluatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Compares the latest metrics and health snapshot against thresholds and
/// routes breaches to the configured notifiers.
pub struct AlertEvaluator {
    config: AlertEvaluatorConfig,
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthMonitor>,
    notifier: Arc<dyn Notifier>,
    /// Additional channel for critical alerts only.
    escalation: Option<Arc<dyn Notifier>>,
}

impl AlertEvaluator {
    pub fn new(
        config: AlertEvaluatorConfig,
        metrics: Arc<MetricsCollector>,
        health: Arc<HealthMonitor>,
        notifier: Arc<dyn Notifier>,
        escalation: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            config,
            metrics,
            health,
            notifier,
            escalation,
        }
    }

    /// Pure threshold comparison: latest metrics sample plus the current
    /// health snapshot against the configured limits.
    pub fn evaluate(
        metrics: Option<&SystemMetrics>,
        health: &HealthSnapshot,
        thresholds: &AlertThresholds,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if let Some(m) = metrics {
            if m.cpu_percent > thresholds.cpu_percent {
                alerts.push(Alert::new(
                    AlertSeverity::Warning,
                    "High CPU Usage Alert",
                    &format!(
                        "CPU usage is {:.1}% (threshold: {:.1}%)",
                        m.cpu_percent, thresholds.cpu_percent
                    ),
                    json!({"cpu_percent": m.cpu_percent, "threshold": thresholds.cpu_percent}),
                ));
            }

            if m.memory_percent > thresholds.memory_percent {
                alerts.push(Alert::new(
                    AlertSeverity::Warning,
                    "High Memory Usage Alert",
                    &format!(
                        "Memory usage is {:.1}% (threshold: {:.1}%)",
                        m.memory_percent, thresholds.memory_percent
                    ),
                    json!({"memory_percent": m.memory_percent, "threshold": thresholds.memory_percent}),
                ));
            }

            if m.disk_percent > thresholds.disk_percent {
                alerts.push(Alert::new(
                    AlertSeverity::Critical,
                    "High Disk Usage Alert",
                    &format!(
                        "Disk usage is {:.1}% (threshold: {:.1}%)",
                        m.disk_percent, thresholds.disk_percent
                    ),
                    json!({"disk_percent": m.disk_percent, "threshold": thresholds.disk_percent}),
                ));
            }
        }

        for (service, check) in &health.services {
            if check.status == ServiceStatus::Unhealthy {
                let detail = check.details["error"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string();
                alerts.push(Alert::new(
                    AlertSeverity::Critical,
                    &format!("Service Health Alert - {service}"),
                    &format!("Service {service} is unhealthy: {detail}"),
                    json!({"service": service, "status": check.status}),
                ));
            }

            if check.response_time > thresholds.response_time {
                alerts.push(Alert::new(
                    AlertSeverity::Warning,
                    &format!("Slow Response Alert - {service}"),
                    &format!(
                        "Service {service} response time is {:.2}s (threshold: {:.1}s)",
                        check.response_time, thresholds.response_time
                    ),
                    json!({"service": service, "response_time": check.response_time}),
                ));
            }
        }

        alerts
    }

    /// Deliver a batch of alerts. Failures are logged and never interrupt
    /// the rest of the batch.
    pub async fn dispatch(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            if let Err(e) = self.notifier.send(&alert).await {
                error!(
                    channel = self.notifier.name(),
                    title = %alert.title,
                    error = %e,
                    "alert delivery failed"
                );
            }

            if alert.severity == AlertSeverity::Critical {
                if let Some(escalation) = &self.escalation {
                    if let Err(e) = escalation.send(&alert).await {
                        error!(
                            channel = escalation.name(),
                            title = %alert.title,
                            error = %e,
                            "alert escalation failed"
                        );
                    }
                }
            }
        }
    }

    /// One evaluation pass over current observations.
    pub async fn run_cycle(&self) {
        let metrics = self.metrics.latest();
        let health = self.health.health_snapshot();
        let alerts = Self::evaluate(metrics.as_ref(), &health, &self.config.thresholds);

        if !alerts.is_empty() {
            info!(count = alerts.len(), "alert conditions met");
        }
        self.dispatch(alerts).await;
    }

    /// Evaluation loop. Exits after the current cycle when `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(
            interval_secs = self.config.interval.as_secs(),
            "alert evaluator started"
        );

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

        info!("alert evaluator stopped");
    }
}
