//! Metrics Collection
//!
//! Collects and exports metrics for the connection layer including:
//! - Connection registrations, evictions and stale deactivations
//! - Selections per strategy and selection latency
//! - Anomalies and system health
//! - Alerts raised and notification failures
//! - Prometheus export

use feedlink_core::alert::{AlertSeverity, AlertType, NotificationChannel};
use feedlink_core::config::MetricsConfig as MetricsSettings;
use feedlink_core::types::{StrategyKind, TrafficClass};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::store::StoreStats;

/// Connection store metrics collector
#[derive(Debug)]
pub struct StoreMetrics {
    registered: AtomicU64,
    removed: AtomicU64,
    evicted: AtomicU64,
    stale: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "feedlink_connections_registered_total",
            "Total connections registered"
        );
        describe_counter!("feedlink_connections_removed_total", "Total connections removed");
        describe_counter!(
            "feedlink_connections_evicted_total",
            "Total inactive connections evicted to make room"
        );
        describe_counter!(
            "feedlink_connections_stale_total",
            "Total connections deactivated by the staleness sweep"
        );
        describe_gauge!("feedlink_connections", "Registered connections per class");
        describe_gauge!("feedlink_connections_active", "Active connections per class");
        describe_gauge!("feedlink_cluster_nodes", "Registered cluster nodes");

        Self {
            registered: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn record_registered(&self, class: TrafficClass) {
        self.registered.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_connections_registered_total", "class" => class.as_str()).increment(1);
    }

    pub fn record_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_connections_removed_total").increment(1);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_connections_evicted_total").increment(1);
    }

    pub fn record_stale(&self, count: usize) {
        self.stale.fetch_add(count as u64, Ordering::Relaxed);
        counter!("feedlink_connections_stale_total").increment(count as u64);
    }

    /// Update gauge metrics (called after each sweep)
    pub fn update_gauges(&self, stats: &StoreStats) {
        for class in TrafficClass::ALL {
            let counts = stats.by_class.get(&class).copied().unwrap_or_default();
            gauge!("feedlink_connections", "class" => class.as_str()).set(counts.total as f64);
            gauge!("feedlink_connections_active", "class" => class.as_str())
                .set(counts.active as f64);
        }
        gauge!("feedlink_cluster_nodes").set(stats.cluster_nodes as f64);
    }

    pub fn get_registered(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn get_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Load balancer metrics collector
#[derive(Debug)]
pub struct SelectionMetrics {
    selections: AtomicU64,
    fallbacks: AtomicU64,
    health_failures: AtomicU64,
}

impl SelectionMetrics {
    pub fn new() -> Self {
        describe_counter!("feedlink_selections_total", "Connection selections per strategy");
        describe_counter!(
            "feedlink_selection_fallbacks_total",
            "Selections that degraded to round-robin after a strategy failure"
        );
        describe_counter!(
            "feedlink_health_check_failures_total",
            "Failed connection health checks"
        );
        describe_histogram!(
            "feedlink_selection_latency_seconds",
            "Time spent choosing a connection"
        );
        describe_gauge!("feedlink_adaptive_strategy", "Strategy chosen by adaptive ranking");

        Self {
            selections: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            health_failures: AtomicU64::new(0),
        }
    }

    pub fn record_selection(&self, strategy: StrategyKind, latency: Duration) {
        self.selections.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_selections_total", "strategy" => strategy.as_str()).increment(1);
        histogram!("feedlink_selection_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn record_fallback(&self, strategy: StrategyKind) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_selection_fallbacks_total", "strategy" => strategy.as_str())
            .increment(1);
    }

    pub fn record_health_failure(&self) {
        self.health_failures.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_health_check_failures_total").increment(1);
    }

    pub fn record_adaptive_choice(&self, strategy: StrategyKind) {
        for kind in StrategyKind::CONCRETE {
            let value = if kind == strategy { 1.0 } else { 0.0 };
            gauge!("feedlink_adaptive_strategy", "strategy" => kind.as_str()).set(value);
        }
    }

    pub fn get_selections(&self) -> u64 {
        self.selections.load(Ordering::Relaxed)
    }

    pub fn get_fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

impl Default for SelectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Analytics metrics collector
#[derive(Debug)]
pub struct AnalyticsMetrics {
    anomalies: AtomicU64,
    samples: AtomicU64,
}

impl AnalyticsMetrics {
    pub fn new() -> Self {
        describe_counter!("feedlink_anomalies_total", "Anomalies detected per kind");
        describe_counter!("feedlink_analytics_samples_total", "Aggregated class samples");
        describe_gauge!("feedlink_system_health_score", "Mean health score of active connections");
        describe_gauge!("feedlink_class_latency_ms", "Mean latency per class");
        describe_gauge!("feedlink_class_throughput", "Messages per second per class");

        Self {
            anomalies: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record_anomaly(&self, kind: &'static str) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_anomalies_total", "kind" => kind).increment(1);
    }

    pub fn record_sample(&self, class: TrafficClass, latency_ms: f64, throughput: f64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_analytics_samples_total").increment(1);
        gauge!("feedlink_class_latency_ms", "class" => class.as_str()).set(latency_ms);
        gauge!("feedlink_class_throughput", "class" => class.as_str()).set(throughput);
    }

    pub fn record_system_score(&self, score: f64) {
        gauge!("feedlink_system_health_score").set(score);
    }

    pub fn get_anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }
}

impl Default for AnalyticsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Alerting metrics collector
#[derive(Debug)]
pub struct AlertMetrics {
    raised: AtomicU64,
    suppressed: AtomicU64,
    delivery_failures: AtomicU64,
}

impl AlertMetrics {
    pub fn new() -> Self {
        describe_counter!("feedlink_alerts_total", "Alerts raised per type and severity");
        describe_counter!(
            "feedlink_alerts_suppressed_total",
            "Alerts suppressed by an active cooldown"
        );
        describe_counter!(
            "feedlink_notification_failures_total",
            "Failed notification deliveries per channel"
        );
        describe_gauge!("feedlink_alerts_active", "Unresolved alerts");

        Self {
            raised: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    pub fn record_raised(&self, alert_type: AlertType, severity: AlertSeverity) {
        self.raised.fetch_add(1, Ordering::Relaxed);
        counter!(
            "feedlink_alerts_total",
            "type" => alert_type.as_str(),
            "severity" => severity.as_str()
        )
        .increment(1);
    }

    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_alerts_suppressed_total").increment(1);
    }

    pub fn record_delivery_failure(&self, channel: NotificationChannel) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        counter!("feedlink_notification_failures_total", "channel" => channel.as_str())
            .increment(1);
    }

    pub fn set_active(&self, active: usize) {
        gauge!("feedlink_alerts_active").set(active as f64);
    }

    pub fn get_raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    pub fn get_delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }
}

impl Default for AlertMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Enable metrics export
    pub enabled: bool,
    /// Prometheus HTTP endpoint address
    pub bind_address: SocketAddr,
    /// Histogram buckets for latency (in seconds)
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9090)),
            latency_buckets: vec![
                0.000_001, 0.000_005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01,
            ],
        }
    }
}

impl MetricsConfig {
    /// Builds the exporter settings from the application configuration.
    pub fn from_settings(settings: &MetricsSettings) -> anyhow::Result<Self> {
        let bind_address = settings.bind_address.parse().map_err(|e| {
            anyhow::anyhow!("invalid metrics bind address '{}': {}", settings.bind_address, e)
        })?;
        Ok(Self {
            enabled: settings.enabled,
            bind_address,
            ..Default::default()
        })
    }
}

/// Prometheus exporter serving `/metrics` on its own HTTP listener
pub struct MetricsExporter {
    config: MetricsConfig,
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create a new metrics exporter
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// Install the recorder and start the scrape listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Metrics export disabled");
            return Ok(());
        }

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.config.bind_address)
            .set_buckets_for_metric(
                Matcher::Suffix("latency_seconds".to_string()),
                &self.config.latency_buckets,
            )?;

        let (recorder, exporter) = builder.build()?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics listener stopped");
            }
        });
        self.handle = Some(handle);

        info!(
            bind_address = %self.config.bind_address,
            "Prometheus metrics exporter initialized"
        );

        Ok(())
    }

    /// Get current metrics snapshot as string
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.render())
    }
}

/// Global metrics registry
pub struct MetricsRegistry {
    store: Arc<StoreMetrics>,
    selection: Arc<SelectionMetrics>,
    analytics: Arc<AnalyticsMetrics>,
    alerts: Arc<AlertMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            store: Arc::new(StoreMetrics::new()),
            selection: Arc::new(SelectionMetrics::new()),
            analytics: Arc::new(AnalyticsMetrics::new()),
            alerts: Arc::new(AlertMetrics::new()),
        }
    }

    pub fn store(&self) -> Arc<StoreMetrics> {
        Arc::clone(&self.store)
    }

    pub fn selection(&self) -> Arc<SelectionMetrics> {
        Arc::clone(&self.selection)
    }

    pub fn analytics(&self) -> Arc<AnalyticsMetrics> {
        Arc::clone(&self.analytics)
    }

    pub fn alerts(&self) -> Arc<AlertMetrics> {
        Arc::clone(&self.alerts)
    }

    /// Get metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_registered: self.store.get_registered(),
            connections_evicted: self.store.get_evicted(),
            selections: self.selection.get_selections(),
            selection_fallbacks: self.selection.get_fallbacks(),
            anomalies: self.analytics.get_anomalies(),
            alerts_raised: self.alerts.get_raised(),
            notification_failures: self.alerts.get_delivery_failures(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics snapshot for reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections_registered: u64,
    pub connections_evicted: u64,
    pub selections: u64,
    pub selection_fallbacks: u64,
    pub anomalies: u64,
    pub alerts_raised: u64,
    pub notification_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_metrics() {
        let metrics = StoreMetrics::new();

        metrics.record_registered(TrafficClass::MarketData);
        metrics.record_registered(TrafficClass::Trading);
        metrics.record_evicted();

        assert_eq!(metrics.get_registered(), 2);
        assert_eq!(metrics.get_evicted(), 1);
    }

    #[test]
    fn test_registry_snapshot() {
        let registry = MetricsRegistry::new();
        registry
            .selection()
            .record_selection(StrategyKind::RoundRobin, Duration::from_micros(3));
        registry.selection().record_fallback(StrategyKind::LeastLatency);
        registry
            .alerts()
            .record_raised(AlertType::HighLatency, AlertSeverity::Warning);
        registry
            .alerts()
            .record_delivery_failure(NotificationChannel::Webhook);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.selections, 1);
        assert_eq!(snapshot.selection_fallbacks, 1);
        assert_eq!(snapshot.alerts_raised, 1);
        assert_eq!(snapshot.notification_failures, 1);
    }

    #[test]
    fn test_metrics_config_from_settings() {
        let settings = MetricsSettings::default();
        let config = MetricsConfig::from_settings(&settings).unwrap();
        assert!(config.enabled);
        assert_eq!(config.bind_address.port(), 9090);

        let bad = MetricsSettings {
            enabled: true,
            bind_address: "not an address".to_string(),
        };
        assert!(MetricsConfig::from_settings(&bad).is_err());
    }
}
