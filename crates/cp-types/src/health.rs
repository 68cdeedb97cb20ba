use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single probed dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Operating normally.
    Healthy,
    /// Reachable but impaired (e.g. cache unavailable, fallback in use).
    Degraded,
    /// Probe failed outright.
    Unhealthy,
}

/// Result of one probe of one dependency. Replaced wholesale every cycle —
/// last probe wins, results are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: ServiceStatus,
    /// Probe round-trip in seconds.
    pub response_time: f64,
    pub checked_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl ServiceHealth {
    pub fn new(service: &str, status: ServiceStatus, response_time: f64) -> Self {
        Self {
            service: service.to_string(),
            status,
            response_time,
            checked_at: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Snapshot of the whole system's health as of the last completed probe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall_status: ServiceStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot before the first probe cycle has completed: no services,
    /// reported healthy.
    pub fn empty() -> Self {
        Self {
            overall_status: ServiceStatus::Healthy,
            services: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a snapshot from one cycle's probe results, deriving the overall
    /// status: unhealthy if any service is unhealthy, else degraded if any is
    /// degraded, else healthy.
    pub fn from_checks(checks: Vec<ServiceHealth>) -> Self {
        let mut overall = ServiceStatus::Healthy;
        for check in &checks {
            match check.status {
                ServiceStatus::Unhealthy => {
                    overall = ServiceStatus::Unhealthy;
                    break;
                }
                ServiceStatus::Degraded => overall = ServiceStatus::Degraded,
                ServiceStatus::Healthy => {}
            }
        }

        Self {
            overall_status: overall,
            services: checks
                .into_iter()
                .map(|c| (c.service.clone(), c))
                .collect(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(service: &str, status: ServiceStatus) -> ServiceHealth {
        ServiceHealth::new(service, status, 0.01)
    }

    #[test]
    fn overall_healthy_when_all_healthy() {
        let snap = HealthSnapshot::from_checks(vec![
            check("storage", ServiceStatus::Healthy),
            check("cache", ServiceStatus::Healthy),
        ]);
        assert_eq!(snap.overall_status, ServiceStatus::Healthy);
    }

    #[test]
    fn overall_degraded_when_one_degraded() {
        let snap = HealthSnapshot::from_checks(vec![
            check("storage", ServiceStatus::Healthy),
            check("cache", ServiceStatus::Degraded),
        ]);
        assert_eq!(snap.overall_status, ServiceStatus::Degraded);
    }

    #[test]
    fn unhealthy_wins_over_degraded() {
        let snap = HealthSnapshot::from_checks(vec![
            check("cache", ServiceStatus::Degraded),
            check("storage", ServiceStatus::Unhealthy),
            check("external_apis", ServiceStatus::Healthy),
        ]);
        assert_eq!(snap.overall_status, ServiceStatus::Unhealthy);
    }

    #[test]
    fn empty_snapshot_is_healthy() {
        let snap = HealthSnapshot::empty();
        assert_eq!(snap.overall_status, ServiceStatus::Healthy);
        assert!(snap.services.is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }
}
