//! Host resource sampling with a bounded in-memory history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};
use tokio::sync::watch;
use tracing::info;

use cp_types::metrics::{
    AlertThresholds, MetricsSummary, NetworkIo, ResourceAverages, SystemMetrics,
};

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsCollectorConfig {
    pub interval: Duration,
    /// Samples older than this are pruned on every record.
    pub history_window: Duration,
    /// Trailing window the summary averages over.
    pub average_window: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MetricsCollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_window: Duration::from_secs(24 * 60 * 60),
            average_window: Duration::from_secs(60 * 60),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Periodic sampler of CPU / memory / disk / network / process counts.
pub struct MetricsCollector {
    config: MetricsCollectorConfig,
    system: Mutex<System>,
    history: RwLock<VecDeque<SystemMetrics>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsCollectorConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new_all()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Take one sample of current host usage.
    pub fn sample(&self) -> SystemMetrics {
        let mut sys = self.system.lock();
        sys.refresh_all();

        let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;

        let total_memory = sys.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total_memory as f64 * 100.0
        };

        let (disk_total, disk_available) = sys
            .disks()
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_percent = if disk_total == 0 {
            0.0
        } else {
            (disk_total - disk_available) as f64 / disk_total as f64 * 100.0
        };

        let mut network_io = NetworkIo::default();
        for (_, data) in sys.networks().iter() {
            network_io.bytes_received += data.total_received();
            network_io.bytes_transmitted += data.total_transmitted();
            network_io.packets_received += data.total_packets_received();
            network_io.packets_transmitted += data.total_packets_transmitted();
        }

        SystemMetrics {
            cpu_percent,
            memory_percent,
            disk_percent,
            network_io,
            process_count: sys.processes().len(),
            sampled_at: Utc::now(),
        }
    }

    /// Append a sample and prune anything past the history window.
    pub fn record(&self, metrics: SystemMetrics) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.history_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let mut history = self.history.write();
        history.push_back(metrics);
        while history
            .front()
            .map(|m| m.sampled_at < cutoff)
            .unwrap_or(false)
        {
            history.pop_front();
        }
    }

    /// Most recent sample, if any cycle has completed.
    pub fn latest(&self) -> Option<SystemMetrics> {
        self.history.read().back().cloned()
    }

    pub fn sample_count(&self) -> usize {
        self.history.read().len()
    }

    /// Current sample plus trailing-window averages. `None` before the first
    /// sample; averages are `None` when no samples fall inside the window
    /// (explicit no-data rather than a division by zero).
    pub fn summary(&self) -> Option<MetricsSummary> {
        let history = self.history.read();
        let current = history.back()?.clone();

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.average_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let recent: Vec<&SystemMetrics> =
            history.iter().filter(|m| m.sampled_at > cutoff).collect();

        let averages_1h = if recent.is_empty() {
            None
        } else {
            let n = recent.len() as f64;
            Some(ResourceAverages {
                cpu_percent: recent.iter().map(|m| m.cpu_percent).sum::<f64>() / n,
                memory_percent: recent.iter().map(|m| m.memory_percent).sum::<f64>() / n,
                disk_percent: recent.iter().map(|m| m.disk_percent).sum::<f64>() / n,
            })
        };

        Some(MetricsSummary {
            current,
            averages_1h,
            thresholds: self.config.thresholds,
        })
    }

    /// Sample-and-record one cycle.
    pub fn run_cycle(&self) {
        let metrics = self.sample();
        info!(
            cpu = metrics.cpu_percent,
            memory = metrics.memory_percent,
            disk = metrics.disk_percent,
            processes = metrics.process_count,
            "system metrics"
        );
        self.record(metrics);
    }

    /// Collection loop. Exits after the current cycle when `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(
            interval_secs = self.config.interval.as_secs(),
            "metrics collector started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("metrics collector stopped");
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("samples", &self.sample_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn constant_sample(cpu: f64, age: ChronoDuration) -> SystemMetrics {
        SystemMetrics {
            cpu_percent: cpu,
            memory_percent: 50.0,
            disk_percent: 40.0,
            network_io: NetworkIo::default(),
            process_count: 100,
            sampled_at: Utc::now() - age,
        }
    }

    #[test]
    fn summary_is_none_without_samples() {
        let collector = MetricsCollector::new(MetricsCollectorConfig::default());
        assert!(collector.summary().is_none());
    }

    #[test]
    fn constant_metric_averages_to_itself() {
        let collector = MetricsCollector::new(MetricsCollectorConfig::default());
        // Simulate >1h of 30s samples at a constant value.
        for minutes in 0..80 {
            collector.record(constant_sample(42.0, ChronoDuration::minutes(minutes)));
        }

        let summary = collector.summary().unwrap();
        let averages = summary.averages_1h.unwrap();
        assert!((averages.cpu_percent - 42.0).abs() < 1e-9);
        assert!((averages.memory_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stale_samples_fall_out_of_the_average_window() {
        let collector = MetricsCollector::new(MetricsCollectorConfig::default());
        collector.record(constant_sample(90.0, ChronoDuration::hours(2)));

        let summary = collector.summary().unwrap();
        // The only sample is older than the trailing hour: explicit no-data.
        assert!(summary.averages_1h.is_none());
        assert_eq!(summary.current.cpu_percent, 90.0);
    }

    #[test]
    fn history_is_pruned_past_24h() {
        let collector = MetricsCollector::new(MetricsCollectorConfig::default());
        collector.record(constant_sample(10.0, ChronoDuration::hours(25)));
        collector.record(constant_sample(20.0, ChronoDuration::minutes(1)));

        assert_eq!(collector.sample_count(), 1);
        assert_eq!(collector.latest().unwrap().cpu_percent, 20.0);
    }

    #[test]
    fn live_sample_is_plausible() {
        let collector = MetricsCollector::new(MetricsCollectorConfig::default());
        let metrics = collector.sample();

        assert!(metrics.memory_percent >= 0.0 && metrics.memory_percent <= 100.0);
        assert!(metrics.disk_percent >= 0.0 && metrics.disk_percent <= 100.0);
    }
}
