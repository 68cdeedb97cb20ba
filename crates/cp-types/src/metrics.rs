use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative network I/O counters at sampling time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub packets_received: u64,
    pub packets_transmitted: u64,
}

/// One sample of host resource usage. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_io: NetworkIo,
    pub process_count: usize,
    pub sampled_at: DateTime<Utc>,
}

/// Mean resource usage over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAverages {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Read-side view of collected metrics: the latest sample, trailing-hour
/// averages (absent when no samples fall inside the window), and the
/// thresholds alerts are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub current: SystemMetrics,
    pub averages_1h: Option<ResourceAverages>,
    pub thresholds: AlertThresholds,
}

/// Resource and responsiveness levels above which alerts fire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Probe response time in seconds.
    pub response_time: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
            response_time: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let t = AlertThresholds::default();
        assert_eq!(t.cpu_percent, 80.0);
        assert_eq!(t.memory_percent, 85.0);
        assert_eq!(t.disk_percent, 90.0);
        assert_eq!(t.response_time, 5.0);
    }
}
