//! Configuration management for feedlink.
//!
//! This module provides a configuration system that supports:
//! - Loading from YAML files
//! - Environment variable overrides (`FEEDLINK__SECTION__KEY`)
//! - Validation of all settings
//! - Store, balancer, analytics, alerting, notification, logging and
//!   metrics sections, plus connection definitions for the CLI harness

use crate::alert::AlertRule;
use crate::error::{ConfigError, Result};
use crate::types::{StrategyKind, TrafficClass};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use feedlink_core::config::AppConfig;
///
/// let config = AppConfig::from_file("config.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application-wide settings
    #[serde(default)]
    pub app: ApplicationConfig,

    /// Connection store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Load balancer settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Analytics engine settings
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Alert manager settings
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Notification channel endpoints
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Connections managed by the CLI harness
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering environment
    /// variables (`FEEDLINK__ALERTS__EVALUATION_INTERVAL_SECS=10`) over the
    /// file.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("FEEDLINK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// Checks for:
    /// - Non-zero capacities and intervals
    /// - Sensible analytics thresholds
    /// - Valid alert rules
    /// - No duplicate connection ids
    /// - A parseable log level
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.balancer.validate()?;
        self.analytics.validate()?;
        self.alerts.validate()?;
        self.logging.parse_level()?;

        let mut seen = HashSet::new();
        for conn in &self.connections {
            if conn.id.is_empty() {
                return Err(ConfigError::invalid_value("connections.id", "cannot be empty").into());
            }
            if !seen.insert(conn.id.as_str()) {
                return Err(ConfigError::DuplicateConnection {
                    id: conn.id.clone(),
                }
                .into());
            }
            if let Some(weight) = conn.weight {
                if !(weight > 0.0 && weight.is_finite()) {
                    return Err(ConfigError::invalid_value(
                        format!("connections.{}.weight", conn.id),
                        "must be a positive number",
                    )
                    .into());
                }
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn non_zero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ConfigError::invalid_value(field, "must be greater than 0").into());
    }
    Ok(())
}

/// Application-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Cluster node id of this process
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Advertised node address
    #[serde(default = "default_node_address")]
    pub node_address: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// How often the CLI prints a system overview
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_app_name() -> String {
    "feedlink".to_string()
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_node_address() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    60
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            node_id: default_node_id(),
            node_address: default_node_address(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl ApplicationConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

/// Connection store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum records before eviction kicks in
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Records not updated for this long are deactivated
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,

    /// Interval of the stale-record sweep
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Cluster nodes without a heartbeat for this long are removed
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,

    /// Metrics history entries kept per connection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_stale_threshold() -> u64 {
    30 * 60
}

fn default_cleanup_interval() -> u64 {
    5 * 60
}

fn default_node_timeout() -> u64 {
    5 * 60
}

fn default_history_limit() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            stale_threshold_secs: default_stale_threshold(),
            cleanup_interval_secs: default_cleanup_interval(),
            node_timeout_secs: default_node_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("store.max_connections", self.max_connections as u64)?;
        non_zero("store.cleanup_interval_secs", self.cleanup_interval_secs)?;
        non_zero("store.history_limit", self.history_limit as u64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Strategy used when a class has no override
    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,

    /// Per-class strategy overrides
    #[serde(default)]
    pub class_strategies: HashMap<TrafficClass, StrategyKind>,

    /// Interval of the health sweep
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive failures that exclude a connection from selection
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Health results older than this exclude a connection
    #[serde(default = "default_health_stale")]
    pub health_stale_secs: u64,

    /// Connections idle longer than this fail the health check
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,

    /// Interval of adaptive re-ranking
    #[serde(default = "default_adaptive_interval")]
    pub adaptive_interval_secs: u64,

    /// Selection calls remembered per strategy
    #[serde(default = "default_performance_history")]
    pub performance_history: usize,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::RoundRobin
}

fn default_health_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_health_stale() -> u64 {
    5 * 60
}

fn default_inactivity_threshold() -> u64 {
    10 * 60
}

fn default_adaptive_interval() -> u64 {
    5 * 60
}

fn default_performance_history() -> usize {
    100
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            class_strategies: HashMap::new(),
            health_check_interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            health_stale_secs: default_health_stale(),
            inactivity_threshold_secs: default_inactivity_threshold(),
            adaptive_interval_secs: default_adaptive_interval(),
            performance_history: default_performance_history(),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("balancer.health_check_interval_secs", self.health_check_interval_secs)?;
        non_zero("balancer.adaptive_interval_secs", self.adaptive_interval_secs)?;
        non_zero("balancer.failure_threshold", self.failure_threshold as u64)?;
        non_zero("balancer.performance_history", self.performance_history as u64)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_secs(self.adaptive_interval_secs)
    }
}

/// Analytics engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Interval of per-class aggregation
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval_secs: u64,

    /// Interval of the anomaly scan
    #[serde(default = "default_anomaly_interval")]
    pub anomaly_interval_secs: u64,

    /// Samples kept per class
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Samples a baseline is computed from
    #[serde(default = "default_baseline_window")]
    pub baseline_window: usize,

    /// Samples required before a baseline is trusted
    #[serde(default = "default_min_baseline_samples")]
    pub min_baseline_samples: usize,

    /// Latency z-score that counts as an anomaly
    #[serde(default = "default_latency_z")]
    pub latency_z_threshold: f64,

    /// Latency z-score above which the anomaly is high severity
    #[serde(default = "default_latency_z_high")]
    pub latency_z_high: f64,

    /// Multiple of the baseline error rate that counts as an anomaly
    #[serde(default = "default_error_rate_multiplier")]
    pub error_rate_multiplier: f64,

    /// Reconnects above this count are a stability anomaly
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u64,

    /// Samples compared by the capacity insight (latest N vs previous N)
    #[serde(default = "default_capacity_window")]
    pub capacity_window: usize,

    /// Anomalies kept for status reporting
    #[serde(default = "default_anomaly_history")]
    pub anomaly_history: usize,
}

fn default_aggregation_interval() -> u64 {
    60
}

fn default_anomaly_interval() -> u64 {
    30
}

fn default_max_samples() -> usize {
    10_000
}

fn default_baseline_window() -> usize {
    100
}

fn default_min_baseline_samples() -> usize {
    10
}

fn default_latency_z() -> f64 {
    3.0
}

fn default_latency_z_high() -> f64 {
    5.0
}

fn default_error_rate_multiplier() -> f64 {
    2.0
}

fn default_reconnect_threshold() -> u64 {
    3
}

fn default_capacity_window() -> usize {
    20
}

fn default_anomaly_history() -> usize {
    1_000
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            aggregation_interval_secs: default_aggregation_interval(),
            anomaly_interval_secs: default_anomaly_interval(),
            max_samples: default_max_samples(),
            baseline_window: default_baseline_window(),
            min_baseline_samples: default_min_baseline_samples(),
            latency_z_threshold: default_latency_z(),
            latency_z_high: default_latency_z_high(),
            error_rate_multiplier: default_error_rate_multiplier(),
            reconnect_threshold: default_reconnect_threshold(),
            capacity_window: default_capacity_window(),
            anomaly_history: default_anomaly_history(),
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("analytics.aggregation_interval_secs", self.aggregation_interval_secs)?;
        non_zero("analytics.anomaly_interval_secs", self.anomaly_interval_secs)?;
        non_zero("analytics.max_samples", self.max_samples as u64)?;
        non_zero("analytics.baseline_window", self.baseline_window as u64)?;
        non_zero("analytics.capacity_window", self.capacity_window as u64)?;

        if self.min_baseline_samples > self.baseline_window {
            return Err(ConfigError::invalid_value(
                "analytics.min_baseline_samples",
                "cannot exceed analytics.baseline_window",
            )
            .into());
        }

        if self.latency_z_high < self.latency_z_threshold {
            return Err(ConfigError::invalid_value(
                "analytics.latency_z_high",
                "cannot be below analytics.latency_z_threshold",
            )
            .into());
        }

        Ok(())
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs)
    }

    pub fn anomaly_interval(&self) -> Duration {
        Duration::from_secs(self.anomaly_interval_secs)
    }
}

/// Alert manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Interval of rule evaluation
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Interval of resolved-alert purging
    #[serde(default = "default_alert_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Resolved alerts older than this are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Start from the built-in rule set
    #[serde(default = "default_true")]
    pub builtin_rules: bool,

    /// Additional rules; replace built-ins of the same type
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

fn default_evaluation_interval() -> u64 {
    30
}

fn default_alert_cleanup_interval() -> u64 {
    5 * 60
}

fn default_retention_hours() -> u64 {
    24
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval(),
            cleanup_interval_secs: default_alert_cleanup_interval(),
            retention_hours: default_retention_hours(),
            builtin_rules: true,
            rules: Vec::new(),
        }
    }
}

impl AlertsConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("alerts.evaluation_interval_secs", self.evaluation_interval_secs)?;
        non_zero("alerts.cleanup_interval_secs", self.cleanup_interval_secs)?;
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Built-ins (if enabled) overlaid with the configured rules.
    pub fn effective_rules(&self) -> Vec<AlertRule> {
        let mut rules = if self.builtin_rules {
            AlertRule::builtin()
        } else {
            Vec::new()
        };
        for rule in &self.rules {
            rules.retain(|r| r.alert_type != rule.alert_type);
            rules.push(rule.clone());
        }
        rules
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Notification endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Generic JSON webhook
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Chat incoming-webhook
    #[serde(default)]
    pub chat_webhook_url: Option<String>,

    /// Mail relay settings
    #[serde(default)]
    pub email: Option<EmailConfig>,

    /// HTTP timeout for webhook-style deliveries
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(10))
    }
}

/// Mail relay reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Relay endpoint accepting `{from, to, subject, body}`
    pub relay_url: String,
    /// Sender address
    pub from: String,
    /// Recipients
    pub to: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Whether to include file/line info
    #[serde(default)]
    pub file_line: bool,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file_line: false,
            module_levels: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }

    /// Filter directives: the global level followed by module overrides.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        let mut modules: Vec<_> = self.module_levels.iter().collect();
        modules.sort();
        directives.extend(modules.into_iter().map(|(m, l)| format!("{m}={l}")));
        directives.join(",")
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scrape endpoint bind address
    #[serde(default = "default_metrics_bind")]
    pub bind_address: String,
}

fn default_metrics_bind() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_metrics_bind(),
        }
    }
}

/// A connection the CLI harness registers on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDef {
    /// Connection id
    pub id: String,
    /// Traffic class
    pub class: TrafficClass,
    /// Endpoint URL
    #[serde(default)]
    pub endpoint: String,
    /// Static selection weight
    #[serde(default)]
    pub weight: Option<f64>,
    /// Owning cluster node
    #[serde(default)]
    pub node: Option<String>,
    /// Channels subscribed after connecting
    #[serde(default)]
    pub channels: Vec<String>,
}
