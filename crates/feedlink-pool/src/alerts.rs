//! Alert Manager
//!
//! Evaluates the rule set against the connection store, raises alerts
//! subject to a per-(type, severity) cooldown and hands them to the
//! notification hub. Delivery runs after every lock is released.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feedlink_core::alert::{
    Alert, AlertRule, AlertSeverity, AlertType, NotificationChannel, DEFAULT_COOLDOWN_SECS,
};
use feedlink_core::config::AlertsConfig;
use feedlink_core::error::Result;
use feedlink_core::types::{ConnectionId, ConnectionRecord, ConnectionState};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analytics::mean_health_score;
use crate::metrics::AlertMetrics;
use crate::notify::NotificationHub;
use crate::store::ConnectionStore;

/// Condition that held for a rule.
struct Trigger {
    message: String,
    connection_id: Option<ConnectionId>,
    metrics: BTreeMap<String, f64>,
}

/// Rule evaluation, alert bookkeeping and delivery.
pub struct AlertManager {
    config: AlertsConfig,
    store: Arc<ConnectionStore>,
    rules: RwLock<BTreeMap<AlertType, AlertRule>>,
    alerts: RwLock<Vec<Alert>>,
    /// (type, severity) -> end of cooldown
    cooldowns: Mutex<HashMap<(AlertType, AlertSeverity), DateTime<Utc>>>,
    hub: NotificationHub,
    metrics: Arc<AlertMetrics>,
}

impl AlertManager {
    pub fn new(
        config: AlertsConfig,
        store: Arc<ConnectionStore>,
        hub: NotificationHub,
        metrics: Arc<AlertMetrics>,
    ) -> Self {
        let rules = config
            .effective_rules()
            .into_iter()
            .map(|r| (r.alert_type, r))
            .collect();
        Self {
            config,
            store,
            rules: RwLock::new(rules),
            alerts: RwLock::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            hub,
            metrics,
        }
    }

    /// Adds a rule, replacing any rule of the same type.
    pub fn add_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;
        info!(alert_type = rule.alert_type.as_str(), "Alert rule added");
        self.rules.write().insert(rule.alert_type, rule);
        Ok(())
    }

    pub fn remove_rule(&self, alert_type: AlertType) -> bool {
        self.rules.write().remove(&alert_type).is_some()
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().values().cloned().collect()
    }

    /// Evaluates every enabled rule and delivers the alerts it raised.
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        let records: Vec<ConnectionRecord> =
            self.store.all().into_iter().filter(|r| r.active).collect();

        let mut raised = Vec::new();
        for rule in &rules {
            for trigger in Self::triggers(rule, &records, now) {
                if let Some(alert) = self.create(
                    rule.alert_type,
                    rule.severity,
                    rule.cooldown(),
                    trigger,
                    now,
                ) {
                    raised.push((alert, rule.channels.clone()));
                }
            }
        }

        for (alert, channels) in &raised {
            self.hub.dispatch(alert, channels).await;
        }
        raised.into_iter().map(|(alert, _)| alert).collect()
    }

    pub async fn evaluate(&self) -> Vec<Alert> {
        self.evaluate_at(Utc::now()).await
    }

    fn triggers(rule: &AlertRule, records: &[ConnectionRecord], now: DateTime<Utc>) -> Vec<Trigger> {
        let threshold = rule.threshold;

        if !rule.alert_type.is_per_connection() {
            let score = mean_health_score(records);
            return match rule.alert_type {
                AlertType::DegradedHealth if score < threshold => vec![Trigger {
                    message: format!("System health score {score:.1} is below {threshold:.1}"),
                    connection_id: None,
                    metrics: BTreeMap::from([("health_score".to_string(), score)]),
                }],
                // Anomaly alerts arrive through `raise`.
                _ => Vec::new(),
            };
        }

        records
            .iter()
            .filter_map(|record| {
                let id = &record.id;
                let (message, metrics) = match rule.alert_type {
                    AlertType::ConnectionFailure if record.state == ConnectionState::Error => (
                        format!(
                            "Connection {id} failed: {}",
                            record.metrics.last_error.as_deref().unwrap_or("unknown error")
                        ),
                        BTreeMap::from([("errors".to_string(), record.metrics.errors as f64)]),
                    ),
                    AlertType::HighLatency => {
                        let latency = record.metrics.latency_ms.filter(|l| *l > threshold)?;
                        (
                            format!("Connection {id} latency {latency:.0}ms exceeds {threshold:.0}ms"),
                            BTreeMap::from([("latency_ms".to_string(), latency)]),
                        )
                    }
                    AlertType::HighErrorRate => {
                        let rate = record.window_delta(rule.window(), now).error_rate();
                        if rate <= threshold {
                            return None;
                        }
                        (
                            format!(
                                "Connection {id} error rate {:.1}% exceeds {:.1}%",
                                rate * 100.0,
                                threshold * 100.0
                            ),
                            BTreeMap::from([("error_rate".to_string(), rate)]),
                        )
                    }
                    AlertType::FrequentReconnects => {
                        let reconnects = record.window_delta(rule.window(), now).reconnects;
                        if reconnects as f64 <= threshold {
                            return None;
                        }
                        (
                            format!(
                                "Connection {id} reconnected {reconnects} times in {}s",
                                rule.window_secs
                            ),
                            BTreeMap::from([("reconnects".to_string(), reconnects as f64)]),
                        )
                    }
                    _ => return None,
                };
                Some(Trigger {
                    message,
                    connection_id: Some(id.clone()),
                    metrics,
                })
            })
            .collect()
    }

    /// Stores a new alert unless its (type, severity) is cooling down.
    fn create(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        cooldown: ChronoDuration,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        {
            let mut cooldowns = self.cooldowns.lock();
            let key = (alert_type, severity);
            if cooldowns.get(&key).is_some_and(|until| *until > now) {
                debug!(alert_type = alert_type.as_str(), "Alert suppressed by cooldown");
                self.metrics.record_suppressed();
                return None;
            }
            cooldowns.insert(key, now + cooldown);
        }

        let node_id = trigger
            .connection_id
            .as_deref()
            .and_then(|id| self.store.get(id))
            .and_then(|r| r.owner);
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            message: trigger.message,
            connection_id: trigger.connection_id,
            node_id,
            metrics: trigger.metrics,
            created_at: now,
            resolved: false,
            resolved_at: None,
            resolution_note: None,
        };

        let active = {
            let mut alerts = self.alerts.write();
            alerts.push(alert.clone());
            alerts.iter().filter(|a| !a.resolved).count()
        };
        self.metrics.record_raised(alert_type, severity);
        self.metrics.set_active(active);
        info!(
            alert_id = %alert.id,
            alert_type = alert_type.as_str(),
            severity = severity.as_str(),
            "Alert raised"
        );
        Some(alert)
    }

    /// Raises an alert from outside rule evaluation.
    ///
    /// A rule of the same type supplies channels and cooldown and must be
    /// enabled; without one the defaults apply.
    pub async fn raise(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        connection_id: Option<ConnectionId>,
        metrics: BTreeMap<String, f64>,
    ) -> Option<Alert> {
        let rule = self.rules.read().get(&alert_type).cloned();
        let (cooldown, channels) = match rule {
            Some(rule) if !rule.enabled => return None,
            Some(rule) => (rule.cooldown(), rule.channels),
            None => (
                ChronoDuration::seconds(DEFAULT_COOLDOWN_SECS as i64),
                vec![NotificationChannel::Log],
            ),
        };

        let trigger = Trigger {
            message: message.into(),
            connection_id,
            metrics,
        };
        let alert = self.create(alert_type, severity, cooldown, trigger, Utc::now())?;
        self.hub.dispatch(&alert, &channels).await;
        Some(alert)
    }

    /// Marks an alert resolved. Resolving twice keeps the first resolution.
    pub fn resolve(&self, id: &str, note: Option<String>) -> bool {
        let mut alerts = self.alerts.write();
        let Some(alert) = alerts.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
            alert.resolution_note = note;
            info!(alert_id = %id, "Alert resolved");
        }
        let active = alerts.iter().filter(|a| !a.resolved).count();
        drop(alerts);
        self.metrics.set_active(active);
        true
    }

    /// Drops resolved alerts older than the retention period.
    pub fn purge_resolved_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(self.config.retention_hours as i64);
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| !(a.resolved && a.resolved_at.is_some_and(|t| t < cutoff)));
        let purged = before - alerts.len();
        if purged > 0 {
            debug!(purged, "Purged resolved alerts");
        }
        purged
    }

    pub fn purge_resolved(&self) -> usize {
        self.purge_resolved_at(Utc::now())
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Alerts created within the last `hours`, oldest first.
    pub fn history(&self, hours: u64) -> Vec<Alert> {
        let since = Utc::now() - ChronoDuration::hours(hours as i64);
        self.alerts
            .read()
            .iter()
            .filter(|a| a.created_at >= since)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use async_trait::async_trait;
    use feedlink_core::config::StoreConfig;
    use feedlink_core::types::{MetricsUpdate, TrafficClass};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn channel(&self) -> NotificationChannel {
            NotificationChannel::Log
        }

        async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
            self.seen.lock().push(alert.id.clone());
            Ok(())
        }
    }

    fn setup(rules: Vec<AlertRule>) -> (Arc<ConnectionStore>, AlertManager, Arc<Recorder>) {
        let store = Arc::new(ConnectionStore::new(StoreConfig::default()));
        let metrics = Arc::new(AlertMetrics::new());
        let recorder = Arc::new(Recorder::default());
        let mut hub = NotificationHub::empty(metrics.clone());
        hub.register(recorder.clone());

        let config = AlertsConfig {
            builtin_rules: false,
            rules,
            ..Default::default()
        };
        let manager = AlertManager::new(config, store.clone(), hub, metrics);
        (store, manager, recorder)
    }

    fn latency_rule() -> AlertRule {
        AlertRule::new(AlertType::HighLatency, AlertSeverity::Warning, 1000.0)
    }

    fn connect(store: &ConnectionStore, id: &str) {
        store.register(id, TrafficClass::MarketData);
        store.update_state(id, ConnectionState::Connecting);
        store.update_state(id, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_cooldown_limits_alerts() {
        let (store, manager, recorder) = setup(vec![latency_rule()]);
        connect(&store, "md-1");
        connect(&store, "md-2");
        store.update_metrics("md-1", &MetricsUpdate::latency(1500.0));
        store.update_metrics("md-2", &MetricsUpdate::latency(2500.0));

        let start = Utc::now();
        let mut total = 0;
        for minute in 0..15 {
            total += manager
                .evaluate_at(start + ChronoDuration::minutes(minute))
                .await
                .len();
        }
        assert_eq!(total, 1);
        assert_eq!(recorder.seen.lock().len(), 1);

        let later = manager
            .evaluate_at(start + ChronoDuration::minutes(15))
            .await;
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_and_resolution() {
        let rule = AlertRule::new(AlertType::ConnectionFailure, AlertSeverity::Error, 0.0);
        let (store, manager, _) = setup(vec![rule]);
        connect(&store, "md-1");
        store.record_error("md-1", "socket closed");
        store.update_state("md-1", ConnectionState::Error);

        let alerts = manager.evaluate().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].connection_id.as_deref(), Some("md-1"));
        assert!(alerts[0].message.contains("socket closed"));

        let id = alerts[0].id.clone();
        assert!(manager.resolve(&id, Some("restarted".to_string())));
        assert!(manager.resolve(&id, Some("again".to_string())));
        assert!(manager.active_alerts().is_empty());
        assert_eq!(
            manager.history(1)[0].resolution_note.as_deref(),
            Some("restarted")
        );
        assert!(!manager.resolve("missing", None));
    }

    #[tokio::test]
    async fn test_degraded_health_and_purge() {
        let rule = AlertRule::new(AlertType::DegradedHealth, AlertSeverity::Critical, 50.0);
        // Raised only by the anomaly forwarder, never by evaluation.
        let anomaly = AlertRule::new(AlertType::AnomalyDetected, AlertSeverity::Critical, 0.0);
        let (store, manager, _) = setup(vec![rule, anomaly]);
        connect(&store, "md-1");
        assert!(manager.evaluate().await.is_empty());

        store.update_metrics(
            "md-1",
            &MetricsUpdate {
                messages_received: Some(10),
                errors: Some(10),
                reconnects: Some(5),
                ..Default::default()
            },
        );
        let alerts = manager.evaluate().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DegradedHealth);
        assert_eq!(alerts[0].metrics["health_score"], 20.0);

        manager.resolve(&alerts[0].id, None);
        assert_eq!(manager.purge_resolved_at(Utc::now()), 0);
        assert_eq!(
            manager.purge_resolved_at(Utc::now() + ChronoDuration::hours(25)),
            1
        );
        assert!(manager.history(24).is_empty());
    }

    #[tokio::test]
    async fn test_rules_runtime_mutation() {
        let (store, manager, _) = setup(Vec::new());
        connect(&store, "md-1");
        store.update_metrics("md-1", &MetricsUpdate::latency(1500.0));
        assert!(manager.evaluate().await.is_empty());

        manager.add_rule(latency_rule()).unwrap();
        assert!(manager
            .add_rule(AlertRule::new(AlertType::HighErrorRate, AlertSeverity::Error, 2.0))
            .is_err());
        assert_eq!(manager.evaluate().await.len(), 1);

        assert!(manager.remove_rule(AlertType::HighLatency));
        assert!(!manager.remove_rule(AlertType::HighLatency));
        assert!(manager.rules().is_empty());
    }

    #[tokio::test]
    async fn test_raise_respects_cooldown() {
        let (_, manager, recorder) = setup(Vec::new());
        let raise = || {
            manager.raise(
                AlertType::AnomalyDetected,
                AlertSeverity::Critical,
                "error rate 60%",
                Some("md-1".to_string()),
                BTreeMap::new(),
            )
        };
        assert!(raise().await.is_some());
        assert!(raise().await.is_none());
        assert_eq!(recorder.seen.lock().len(), 1);
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_error_rate_uses_window() {
        let rule = AlertRule::new(AlertType::HighErrorRate, AlertSeverity::Error, 0.05);
        let (store, manager, _) = setup(vec![rule]);
        connect(&store, "md-1");
        store.update_metrics(
            "md-1",
            &MetricsUpdate {
                messages_received: Some(100),
                errors: Some(10),
                ..Default::default()
            },
        );
        let alerts = manager.evaluate().await;
        assert_eq!(alerts.len(), 1);
        assert!((alerts[0].metrics["error_rate"] - 0.1).abs() < 1e-9);
    }
}
