//! Continuous self-observation for the ChainPulse core.
//!
//! Provides:
//! - Periodic dependency health probes with a derived overall status
//! - Host resource sampling into a bounded rolling window
//! - Threshold evaluation that raises alerts through pluggable notifiers
//!
//! Each concern runs as its own long-lived loop; reads always return the
//! last completed snapshot without waiting on an in-flight cycle.

pub mod alerting;
pub mod metrics;
pub mod monitor;

pub use alerting::{
    AlertEvaluator, AlertEvaluatorConfig, LogNotifier, Notifier, WebhookNotifier,
};
pub use metrics::{MetricsCollector, MetricsCollectorConfig};
pub use monitor::{ExternalEndpoint, HealthMonitor, HealthMonitorConfig};
