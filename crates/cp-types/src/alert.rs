use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of an operational alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational — within normal operating range.
    Info,
    /// Warning — approaching or past a soft limit.
    Warning,
    /// Critical — hard limit breached or a dependency is down.
    Critical,
}

/// A single alert raised by threshold evaluation or a producer loop.
///
/// Alerts are ephemeral: handed to a notifier fire-and-forget, never
/// persisted, never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub metadata: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Create a new alert.
    pub fn new(
        severity: AlertSeverity,
        title: &str,
        message: &str,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            message: message.to_string(),
            severity,
            metadata,
            raised_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
    }

    #[test]
    fn alert_serialization_roundtrip() {
        let alert = Alert::new(
            AlertSeverity::Critical,
            "High Disk Usage Alert",
            "Disk usage is 93.0% (threshold: 90.0%)",
            json!({"disk_percent": 93.0, "threshold": 90.0}),
        );
        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(alert.severity, back.severity);
        assert_eq!(alert.title, back.title);
        assert_eq!(alert.metadata, back.metadata);
    }
}
