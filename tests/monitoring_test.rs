//! Store bookkeeping, anomaly detection and alerting working together

use chrono::{Duration as ChronoDuration, Utc};
use feedlink_core::alert::{AlertRule, AlertSeverity, AlertType};
use feedlink_core::config::{AlertsConfig, AnalyticsConfig, StoreConfig};
use feedlink_core::types::{
    ClusterNodeInfo, ConnectionMetrics, ConnectionState, MetricsUpdate, TrafficClass,
};
use feedlink_pool::{
    AlertManager, AlertMetrics, AnalyticsEngine, AnomalyKind, AnomalySeverity, ConnectionStore,
    NotificationHub,
};
use std::collections::HashMap;
use std::sync::Arc;

fn store() -> Arc<ConnectionStore> {
    Arc::new(ConnectionStore::new(StoreConfig::default()))
}

fn connect(store: &ConnectionStore, id: &str, class: TrafficClass) {
    store.register(id, class);
    store.update_state(id, ConnectionState::Connecting);
    store.update_state(id, ConnectionState::Connected);
}

#[test]
fn test_register_starts_disconnected_and_rejects_duplicates() {
    let store = store();
    assert!(store.register("md-1", TrafficClass::MarketData));
    connect(&store, "tr-1", TrafficClass::Trading);

    assert!(!store.register("tr-1", TrafficClass::MarketData));
    let record = store.get("tr-1").unwrap();
    assert_eq!(record.class, TrafficClass::Trading);
    assert_eq!(record.state, ConnectionState::Connected);
    assert_eq!(store.state("md-1"), Some(ConnectionState::Disconnected));
}

#[test]
fn test_active_excludes_disconnected_and_failed() {
    let store = store();
    for id in ["a", "b", "c"] {
        connect(&store, id, TrafficClass::UserData);
    }
    store.update_state("a", ConnectionState::Disconnected);
    store.update_state("b", ConnectionState::Error);
    // Invalid transition leaves the record in Error.
    assert!(!store.update_state("b", ConnectionState::Connected));

    let active: Vec<_> = store.active().into_iter().map(|r| r.id).collect();
    assert_eq!(active, vec!["c".to_string()]);
}

#[test]
fn test_health_score_decreases_with_errors_and_reconnects() {
    let clean = ConnectionMetrics {
        latency_ms: Some(250.0),
        ..Default::default()
    };
    assert_eq!(clean.health_score(), 100.0);

    let mut previous = clean.health_score();
    for errors in 1..20 {
        let metrics = ConnectionMetrics {
            errors,
            reconnects: errors / 2,
            ..clean.clone()
        };
        assert!(metrics.health_score() <= previous);
        previous = metrics.health_score();
    }
}

#[test]
fn test_unregistering_node_deactivates_owned_connections() {
    let store = store();
    assert!(store.register_cluster_node(ClusterNodeInfo::new("node-2", "10.0.0.2")));
    for id in ["md-1", "md-2"] {
        assert!(store.register_with(
            id,
            TrafficClass::MarketData,
            HashMap::new(),
            Some("node-2".to_string())
        ));
    }
    connect(&store, "md-3", TrafficClass::MarketData);

    assert!(store.unregister_cluster_node("node-2"));
    assert!(store.cluster_node("node-2").is_none());
    for record in store.all() {
        assert_ne!(record.owner.as_deref(), Some("node-2"));
    }
    assert!(!store.get("md-1").unwrap().active);
    assert!(!store.get("md-2").unwrap().active);
    assert!(store.get("md-3").unwrap().active);
}

#[test]
fn test_latency_spike_flags_one_high_anomaly() {
    let store = store();
    connect(&store, "md-1", TrafficClass::MarketData);
    let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
    let start = Utc::now();

    store.update_metrics("md-1", &MetricsUpdate::latency(100.0));
    for minute in 0..20 {
        engine.aggregate_at(start + ChronoDuration::minutes(minute));
    }
    store.update_metrics("md-1", &MetricsUpdate::latency(5000.0));

    let anomalies = engine.scan_at(start + ChronoDuration::minutes(20));
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::Latency);
    assert_eq!(anomalies[0].severity, AnomalySeverity::High);
    assert_eq!(anomalies[0].connection_id, "md-1");
}

#[tokio::test]
async fn test_cooldown_allows_one_alert_per_window() {
    let store = store();
    connect(&store, "md-1", TrafficClass::MarketData);
    store.update_metrics("md-1", &MetricsUpdate::latency(2500.0));

    let metrics = Arc::new(AlertMetrics::new());
    let config = AlertsConfig {
        builtin_rules: false,
        rules: vec![AlertRule::new(AlertType::HighLatency, AlertSeverity::Warning, 1000.0)
            .with_cooldown_secs(15 * 60)],
        ..Default::default()
    };
    let alerts = AlertManager::new(
        config,
        store.clone(),
        NotificationHub::empty(metrics.clone()),
        metrics,
    );

    let start = Utc::now();
    let mut raised_per_window = [0usize; 3];
    for minute in 0..45 {
        let raised = alerts
            .evaluate_at(start + ChronoDuration::minutes(minute))
            .await;
        raised_per_window[(minute / 15) as usize] += raised.len();
    }
    assert_eq!(raised_per_window, [1, 1, 1]);
    assert_eq!(alerts.active_alerts().len(), 3);
}
