//! Alert data model.
//!
//! Rules are plain data so they can be loaded from configuration and
//! replaced at runtime; evaluation lives in `feedlink-pool`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConfigError, Result};
use crate::types::{ConnectionId, NodeId};

/// Default time between two alerts of the same (type, severity).
pub const DEFAULT_COOLDOWN_SECS: u64 = 15 * 60;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Connection entered the Error state
    ConnectionFailure,
    /// Latency above threshold (ms)
    HighLatency,
    /// Error rate above threshold (fraction)
    HighErrorRate,
    /// Reconnects above threshold within the window
    FrequentReconnects,
    /// System health score below threshold
    DegradedHealth,
    /// Forwarded statistical anomaly
    AnomalyDetected,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ConnectionFailure => "connection_failure",
            AlertType::HighLatency => "high_latency",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::FrequentReconnects => "frequent_reconnects",
            AlertType::DegradedHealth => "degraded_health",
            AlertType::AnomalyDetected => "anomaly_detected",
        }
    }

    /// Returns true if the rule is evaluated once per connection.
    pub fn is_per_connection(&self) -> bool {
        !matches!(self, AlertType::DegradedHealth | AlertType::AnomalyDetected)
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where notifications go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Standard output
    Console,
    /// The tracing pipeline
    Log,
    /// Mail relay
    Email,
    /// Generic JSON webhook
    Webhook,
    /// Chat incoming-webhook (`{"text": ...}`)
    ChatWebhook,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Console => "console",
            NotificationChannel::Log => "log",
            NotificationChannel::Email => "email",
            NotificationChannel::Webhook => "webhook",
            NotificationChannel::ChatWebhook => "chat_webhook",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_window() -> u64 {
    5 * 60
}

fn default_channels() -> Vec<NotificationChannel> {
    vec![NotificationChannel::Log]
}

/// Declarative alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Alert type this rule produces (one rule per type)
    #[serde(rename = "type")]
    pub alert_type: AlertType,

    /// Whether the rule is evaluated
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Severity of produced alerts
    pub severity: AlertSeverity,

    /// Type-specific threshold (ms, fraction, count, or score)
    #[serde(default)]
    pub threshold: f64,

    /// Evaluation window in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Delivery channels
    #[serde(default = "default_channels")]
    pub channels: Vec<NotificationChannel>,

    /// Minimum seconds between alerts of the same (type, severity)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl AlertRule {
    pub fn new(alert_type: AlertType, severity: AlertSeverity, threshold: f64) -> Self {
        Self {
            alert_type,
            enabled: true,
            severity,
            threshold,
            window_secs: default_window(),
            channels: default_channels(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }

    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_cooldown_secs(mut self, cooldown_secs: u64) -> Self {
        self.cooldown_secs = cooldown_secs;
        self
    }

    pub fn with_window_secs(mut self, window_secs: u64) -> Self {
        self.window_secs = window_secs;
        self
    }

    pub fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.cooldown_secs as i64)
    }

    pub fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.window_secs as i64)
    }

    /// The rules every alert manager starts with.
    pub fn builtin() -> Vec<AlertRule> {
        let channels = vec![NotificationChannel::Console, NotificationChannel::Log];
        vec![
            AlertRule::new(AlertType::ConnectionFailure, AlertSeverity::Error, 0.0)
                .with_channels(channels.clone()),
            AlertRule::new(AlertType::HighLatency, AlertSeverity::Warning, 1000.0)
                .with_channels(channels.clone()),
            AlertRule::new(AlertType::HighErrorRate, AlertSeverity::Error, 0.05)
                .with_channels(channels.clone()),
            AlertRule::new(AlertType::FrequentReconnects, AlertSeverity::Warning, 3.0)
                .with_window_secs(15 * 60)
                .with_channels(channels.clone()),
            AlertRule::new(AlertType::DegradedHealth, AlertSeverity::Critical, 50.0)
                .with_channels(channels),
        ]
    }

    /// Validates the rule.
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::InvalidAlertRule {
                reason: format!("{}: threshold must be a non-negative number", self.alert_type),
            }
            .into());
        }

        if self.alert_type == AlertType::HighErrorRate && self.threshold > 1.0 {
            return Err(ConfigError::InvalidAlertRule {
                reason: "high_error_rate threshold is a fraction between 0 and 1".to_string(),
            }
            .into());
        }

        if self.channels.is_empty() {
            return Err(ConfigError::InvalidAlertRule {
                reason: format!("{}: at least one channel is required", self.alert_type),
            }
            .into());
        }

        Ok(())
    }
}

/// A raised alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id
    pub id: String,
    /// What happened
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    /// How bad it is
    pub severity: AlertSeverity,
    /// Human-readable description
    pub message: String,
    /// Related connection
    pub connection_id: Option<ConnectionId>,
    /// Related cluster node
    pub node_id: Option<NodeId>,
    /// Metric values that triggered the alert
    pub metrics: BTreeMap<String, f64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether an operator resolved it
    pub resolved: bool,
    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator note
    pub resolution_note: Option<String>,
}

impl Alert {
    /// Short single-line form used by console and chat notifiers.
    pub fn summary(&self) -> String {
        match &self.connection_id {
            Some(id) => format!(
                "[{}] {} ({}): {}",
                self.severity.as_str().to_uppercase(),
                self.alert_type,
                id,
                self.message
            ),
            None => format!(
                "[{}] {}: {}",
                self.severity.as_str().to_uppercase(),
                self.alert_type,
                self.message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_are_valid() {
        let rules = AlertRule::builtin();
        assert_eq!(rules.len(), 5);
        for rule in &rules {
            assert!(rule.validate().is_ok(), "{:?}", rule.alert_type);
            assert_eq!(rule.cooldown_secs, DEFAULT_COOLDOWN_SECS);
        }
    }

    #[test]
    fn test_rule_validation() {
        let rule = AlertRule::new(AlertType::HighErrorRate, AlertSeverity::Error, 5.0);
        assert!(rule.validate().is_err());

        let rule = AlertRule::new(AlertType::HighLatency, AlertSeverity::Warning, 500.0)
            .with_channels(Vec::new());
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_from_yaml() {
        let yaml = r#"
type: high_latency
severity: critical
threshold: 250
channels: [webhook, chat_webhook]
"#;
        let rule: AlertRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.alert_type, AlertType::HighLatency);
        assert_eq!(rule.severity, AlertSeverity::Critical);
        assert_eq!(rule.cooldown_secs, DEFAULT_COOLDOWN_SECS);
        assert!(rule.enabled);
        assert_eq!(
            rule.channels,
            vec![NotificationChannel::Webhook, NotificationChannel::ChatWebhook]
        );
    }

    #[test]
    fn test_severity_order() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }
}
