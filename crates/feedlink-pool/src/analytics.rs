//! Analytics Engine
//!
//! Samples every traffic class on a fixed interval, learns per-class
//! baselines from the recent samples and flags connections that stray from
//! them. Detected anomalies go into a bounded history and onto a channel
//! the integration manager drains.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feedlink_core::config::AnalyticsConfig;
use feedlink_core::types::{error_rate, ConnectionId, ConnectionRecord, TrafficClass};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::AnalyticsMetrics;
use crate::store::ConnectionStore;

/// Floor applied to the latency standard deviation, in milliseconds.
const MIN_LATENCY_STDDEV_MS: f64 = 1.0;

/// Pending anomalies kept for the consumer before new ones are dropped.
const ANOMALY_CHANNEL_CAPACITY: usize = 1024;

/// Connection growth that triggers a capacity insight.
const CONNECTION_GROWTH_THRESHOLD: f64 = 0.2;

/// Throughput growth that triggers a capacity insight.
const THROUGHPUT_GROWTH_THRESHOLD: f64 = 0.3;

/// One aggregation of a traffic class.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSample {
    pub timestamp: DateTime<Utc>,
    pub class: TrafficClass,
    /// Mean latency over active connections that reported one
    pub mean_latency_ms: Option<f64>,
    pub bandwidth_bytes: u64,
    pub error_rate: f64,
    /// Connected or authenticated records over registered records
    pub success_ratio: f64,
    /// Messages per second since the previous sample
    pub throughput: f64,
    pub total_connections: usize,
    pub active_connections: usize,
    pub peak_connections: usize,
}

/// Statistical baseline of a class.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub class: TrafficClass,
    pub samples: usize,
    pub latency_mean: Option<f64>,
    pub latency_stddev: Option<f64>,
    pub error_rate_mean: f64,
    pub throughput_mean: f64,
    pub computed_at: DateTime<Utc>,
}

impl Baseline {
    fn compute(
        class: TrafficClass,
        samples: &VecDeque<ClassSample>,
        window: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let recent: Vec<&ClassSample> = samples.iter().rev().take(window).collect();
        let n = recent.len().max(1) as f64;

        let latencies: Vec<f64> = recent.iter().filter_map(|s| s.mean_latency_ms).collect();
        let (latency_mean, latency_stddev) = if latencies.is_empty() {
            (None, None)
        } else {
            let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
            let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>()
                / latencies.len() as f64;
            (Some(mean), Some(variance.sqrt()))
        };

        Self {
            class,
            samples: recent.len(),
            latency_mean,
            latency_stddev,
            error_rate_mean: recent.iter().map(|s| s.error_rate).sum::<f64>() / n,
            throughput_mean: recent.iter().map(|s| s.throughput).sum::<f64>() / n,
            computed_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Latency,
    ErrorRate,
    Stability,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Latency => "latency",
            AnomalyKind::ErrorRate => "error_rate",
            AnomalyKind::Stability => "stability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Medium,
    High,
    Critical,
}

/// A connection behaving unlike its class.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub connection_id: ConnectionId,
    pub class: TrafficClass,
    /// Observed value
    pub value: f64,
    /// Baseline value it was compared with
    pub expected: f64,
    pub confidence: f64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    #[allow(clippy::too_many_arguments)]
    fn new(
        kind: AnomalyKind,
        severity: AnomalySeverity,
        record: &ConnectionRecord,
        value: f64,
        expected: f64,
        distance: f64,
        threshold: f64,
        description: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            connection_id: record.id.clone(),
            class: record.class,
            value,
            expected,
            confidence: (distance / (2.0 * threshold)).min(1.0),
            description,
            detected_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Good,
    Fair,
    Poor,
    Critical,
}

/// Health summary over active connections.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub score: f64,
    pub status: SystemStatus,
    pub active_connections: usize,
    pub connection_scores: BTreeMap<ConnectionId, f64>,
    pub critical_anomalies_last_hour: usize,
    pub computed_at: DateTime<Utc>,
}

/// Growth trend worth acting on.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityInsight {
    pub class: TrafficClass,
    /// "connections" or "throughput"
    pub metric: &'static str,
    /// Relative growth of the recent window over the one before
    pub growth: f64,
    pub prediction: String,
    pub confidence: f64,
    pub timeframe: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct ClassCursor {
    total_messages: u64,
    at: DateTime<Utc>,
    peak: usize,
}

/// Per-class aggregation, baselines and anomaly detection.
pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    store: Arc<ConnectionStore>,
    samples: RwLock<HashMap<TrafficClass, VecDeque<ClassSample>>>,
    baselines: RwLock<HashMap<TrafficClass, Baseline>>,
    cursors: Mutex<HashMap<TrafficClass, ClassCursor>>,
    anomalies: RwLock<VecDeque<Anomaly>>,
    anomaly_tx: flume::Sender<Anomaly>,
    anomaly_rx: flume::Receiver<Anomaly>,
    metrics: Arc<AnalyticsMetrics>,
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig, store: Arc<ConnectionStore>) -> Self {
        Self::with_metrics(config, store, Arc::new(AnalyticsMetrics::new()))
    }

    pub fn with_metrics(
        config: AnalyticsConfig,
        store: Arc<ConnectionStore>,
        metrics: Arc<AnalyticsMetrics>,
    ) -> Self {
        let (anomaly_tx, anomaly_rx) = flume::bounded(ANOMALY_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            samples: RwLock::new(HashMap::new()),
            baselines: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            anomalies: RwLock::new(VecDeque::new()),
            anomaly_tx,
            anomaly_rx,
            metrics,
        }
    }

    /// Anomalies as they are detected.
    ///
    /// Receivers share one queue, so each anomaly reaches one of them.
    pub fn subscribe(&self) -> flume::Receiver<Anomaly> {
        self.anomaly_rx.clone()
    }

    /// Takes one sample of every class that has registered connections and
    /// refreshes the baselines.
    pub fn aggregate_at(&self, now: DateTime<Utc>) -> Vec<ClassSample> {
        let mut taken = Vec::new();

        for class in TrafficClass::ALL {
            let records = self.store.by_class(class);
            if records.is_empty() {
                continue;
            }
            let sample = self.sample_class(class, &records, now);
            self.metrics.record_sample(
                class,
                sample.mean_latency_ms.unwrap_or(0.0),
                sample.throughput,
            );

            let baseline = {
                let mut samples = self.samples.write();
                let history = samples.entry(class).or_default();
                history.push_back(sample.clone());
                while history.len() > self.config.max_samples {
                    history.pop_front();
                }
                Baseline::compute(class, history, self.config.baseline_window, now)
            };
            self.baselines.write().insert(class, baseline);
            taken.push(sample);
        }

        debug!(classes = taken.len(), "Aggregated class samples");
        taken
    }

    pub fn aggregate(&self) -> Vec<ClassSample> {
        self.aggregate_at(Utc::now())
    }

    fn sample_class(
        &self,
        class: TrafficClass,
        records: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> ClassSample {
        let active: Vec<&ConnectionRecord> = records.iter().filter(|r| r.is_active()).collect();
        let latencies: Vec<f64> = active.iter().filter_map(|r| r.metrics.latency_ms).collect();
        let mean_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        let total_messages: u64 = records.iter().map(|r| r.metrics.total_messages()).sum();
        let errors: u64 = records.iter().map(|r| r.metrics.errors).sum();
        let usable = records.iter().filter(|r| r.state.is_usable()).count();

        let mut cursors = self.cursors.lock();
        let (throughput, peak) = match cursors.get(&class) {
            Some(prev) => {
                let secs = (now - prev.at).num_milliseconds() as f64 / 1000.0;
                let delta = total_messages.saturating_sub(prev.total_messages) as f64;
                let throughput = if secs > 0.0 { delta / secs } else { 0.0 };
                (throughput, prev.peak.max(active.len()))
            }
            None => (0.0, active.len()),
        };
        cursors.insert(
            class,
            ClassCursor {
                total_messages,
                at: now,
                peak,
            },
        );

        ClassSample {
            timestamp: now,
            class,
            mean_latency_ms,
            bandwidth_bytes: records.iter().map(|r| r.metrics.bandwidth_bytes).sum(),
            error_rate: error_rate(errors, total_messages),
            success_ratio: usable as f64 / records.len() as f64,
            throughput,
            total_connections: records.len(),
            active_connections: active.len(),
            peak_connections: peak,
        }
    }

    /// Checks every active connection against its class baseline.
    pub fn scan_at(&self, now: DateTime<Utc>) -> Vec<Anomaly> {
        let baselines = self.baselines.read().clone();
        let mut found = Vec::new();

        for record in self.store.active() {
            if let Some(anomaly) = self.check_stability(&record, now) {
                found.push(anomaly);
            }

            let Some(baseline) = baselines
                .get(&record.class)
                .filter(|b| b.samples >= self.config.min_baseline_samples)
            else {
                continue;
            };
            if let Some(anomaly) = self.check_latency(&record, baseline, now) {
                found.push(anomaly);
            }
            if let Some(anomaly) = self.check_error_rate(&record, baseline, now) {
                found.push(anomaly);
            }
        }

        for anomaly in &found {
            self.publish(anomaly.clone());
        }
        found
    }

    pub fn scan(&self) -> Vec<Anomaly> {
        self.scan_at(Utc::now())
    }

    fn check_latency(
        &self,
        record: &ConnectionRecord,
        baseline: &Baseline,
        now: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let latency = record.metrics.latency_ms?;
        let mean = baseline.latency_mean?;
        let stddev = baseline
            .latency_stddev
            .unwrap_or(0.0)
            .max(MIN_LATENCY_STDDEV_MS);

        let z = (latency - mean).abs() / stddev;
        let threshold = self.config.latency_z_threshold;
        if z <= threshold {
            return None;
        }

        let severity = if z > self.config.latency_z_high {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        Some(Anomaly::new(
            AnomalyKind::Latency,
            severity,
            record,
            latency,
            mean,
            z,
            threshold,
            format!("latency {latency:.1}ms is {z:.1} standard deviations from {mean:.1}ms"),
            now,
        ))
    }

    fn check_error_rate(
        &self,
        record: &ConnectionRecord,
        baseline: &Baseline,
        now: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let rate = record.metrics.error_rate();
        let multiplier = self.config.error_rate_multiplier;
        let expected = baseline.error_rate_mean;
        if rate <= 0.0 || rate <= expected * multiplier {
            return None;
        }

        let ratio = if expected > 0.0 {
            rate / expected
        } else {
            f64::INFINITY
        };
        let severity = if rate >= 0.5 {
            AnomalySeverity::Critical
        } else if ratio > 2.0 * multiplier {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        Some(Anomaly::new(
            AnomalyKind::ErrorRate,
            severity,
            record,
            rate,
            expected,
            ratio,
            multiplier,
            format!(
                "error rate {:.1}% against class baseline {:.1}%",
                rate * 100.0,
                expected * 100.0
            ),
            now,
        ))
    }

    fn check_stability(&self, record: &ConnectionRecord, now: DateTime<Utc>) -> Option<Anomaly> {
        let reconnects = record.metrics.reconnects;
        let threshold = self.config.reconnect_threshold;
        if reconnects <= threshold {
            return None;
        }

        let severity = if reconnects > 10 {
            AnomalySeverity::Critical
        } else if reconnects > 6 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        Some(Anomaly::new(
            AnomalyKind::Stability,
            severity,
            record,
            reconnects as f64,
            threshold as f64,
            reconnects as f64,
            threshold as f64,
            format!("{reconnects} reconnects"),
            now,
        ))
    }

    fn publish(&self, anomaly: Anomaly) {
        warn!(
            connection_id = %anomaly.connection_id,
            kind = anomaly.kind.as_str(),
            severity = ?anomaly.severity,
            confidence = anomaly.confidence,
            "{}",
            anomaly.description
        );
        self.metrics.record_anomaly(anomaly.kind.as_str());

        {
            let mut history = self.anomalies.write();
            history.push_back(anomaly.clone());
            while history.len() > self.config.anomaly_history {
                history.pop_front();
            }
        }

        if self.anomaly_tx.try_send(anomaly).is_err() {
            debug!("Anomaly channel full, dropping notification");
        }
    }

    /// Anomalies detected at or after `since`, oldest first.
    pub fn anomalies_since(&self, since: DateTime<Utc>) -> Vec<Anomaly> {
        self.anomalies
            .read()
            .iter()
            .filter(|a| a.detected_at >= since)
            .cloned()
            .collect()
    }

    pub fn recent_anomalies(&self, limit: usize) -> Vec<Anomaly> {
        let history = self.anomalies.read();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn samples(&self, class: TrafficClass) -> Vec<ClassSample> {
        self.samples
            .read()
            .get(&class)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_sample(&self, class: TrafficClass) -> Option<ClassSample> {
        self.samples.read().get(&class).and_then(|s| s.back().cloned())
    }

    /// Baseline of a class, if it has enough samples to be trusted.
    pub fn baseline(&self, class: TrafficClass) -> Option<Baseline> {
        self.baselines
            .read()
            .get(&class)
            .filter(|b| b.samples >= self.config.min_baseline_samples)
            .cloned()
    }

    /// Health score of one connection.
    pub fn connection_health(&self, id: &str) -> Option<f64> {
        self.store.get(id).map(|r| r.metrics.health_score())
    }

    pub fn system_health_at(&self, now: DateTime<Utc>) -> SystemHealth {
        let connection_scores: BTreeMap<ConnectionId, f64> = self
            .store
            .active()
            .into_iter()
            .map(|r| (r.id.clone(), r.metrics.health_score()))
            .collect();
        let score = mean_score(connection_scores.values().copied());

        let critical_anomalies_last_hour = self
            .anomalies_since(now - ChronoDuration::hours(1))
            .iter()
            .filter(|a| a.severity == AnomalySeverity::Critical)
            .count();

        let status = if critical_anomalies_last_hour > 0 {
            SystemStatus::Critical
        } else if score < 50.0 {
            SystemStatus::Poor
        } else if score < 80.0 {
            SystemStatus::Fair
        } else {
            SystemStatus::Good
        };
        self.metrics.record_system_score(score);

        SystemHealth {
            score,
            status,
            active_connections: connection_scores.len(),
            connection_scores,
            critical_anomalies_last_hour,
            computed_at: now,
        }
    }

    pub fn system_health(&self) -> SystemHealth {
        self.system_health_at(Utc::now())
    }

    /// Compares the latest samples of each class with the window before
    /// them and reports strong growth.
    pub fn capacity_insights(&self) -> Vec<CapacityInsight> {
        let window = self.config.capacity_window;
        let samples = self.samples.read();
        let mut insights = Vec::new();

        for class in TrafficClass::ALL {
            let Some(history) = samples.get(&class) else {
                continue;
            };
            if window == 0 || history.len() < 2 * window {
                continue;
            }
            let recent: Vec<&ClassSample> = history.iter().rev().take(window).collect();
            let previous: Vec<&ClassSample> = history.iter().rev().skip(window).take(window).collect();

            let mean = |set: &[&ClassSample], f: fn(&ClassSample) -> f64| {
                set.iter().map(|s| f(s)).sum::<f64>() / set.len() as f64
            };

            let connections = growth(
                mean(&previous, |s| s.active_connections as f64),
                mean(&recent, |s| s.active_connections as f64),
            );
            if let Some(g) = connections.filter(|g| *g > CONNECTION_GROWTH_THRESHOLD) {
                insights.push(CapacityInsight {
                    class,
                    metric: "connections",
                    growth: g,
                    prediction: format!(
                        "{} active connections grew {:.0}%; the pool will need more capacity if the trend holds",
                        class,
                        g * 100.0
                    ),
                    confidence: insight_confidence(g),
                    timeframe: insight_timeframe(g),
                    recommendations: vec![
                        format!("Raise store.max_connections ahead of {class} growth"),
                        "Register additional cluster nodes to spread ownership".to_string(),
                    ],
                });
            }

            let throughput = growth(
                mean(&previous, |s| s.throughput),
                mean(&recent, |s| s.throughput),
            );
            if let Some(g) = throughput.filter(|g| *g > THROUGHPUT_GROWTH_THRESHOLD) {
                insights.push(CapacityInsight {
                    class,
                    metric: "throughput",
                    growth: g,
                    prediction: format!(
                        "{} message throughput grew {:.0}%; per-connection load is rising",
                        class,
                        g * 100.0
                    ),
                    confidence: insight_confidence(g),
                    timeframe: insight_timeframe(g),
                    recommendations: vec![
                        format!("Add {class} connections to share the load"),
                        "Prefer the least-load strategy for this class".to_string(),
                    ],
                });
            }
        }

        if !insights.is_empty() {
            info!(insights = insights.len(), "Capacity growth detected");
        }
        insights
    }
}

/// Mean health score of the active records; 100 when there are none.
pub fn mean_health_score(records: &[ConnectionRecord]) -> f64 {
    mean_score(
        records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.metrics.health_score()),
    )
}

fn mean_score(scores: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = scores.fold((0.0, 0usize), |(sum, n), s| (sum + s, n + 1));
    if count == 0 {
        100.0
    } else {
        sum / count as f64
    }
}

fn growth(previous: f64, recent: f64) -> Option<f64> {
    (previous > 0.0).then(|| (recent - previous) / previous)
}

fn insight_confidence(growth: f64) -> f64 {
    (0.5 + growth / 2.0).min(0.95)
}

fn insight_timeframe(growth: f64) -> String {
    if growth > 0.5 {
        "next 24 hours".to_string()
    } else {
        "next 7 days".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedlink_core::config::StoreConfig;
    use feedlink_core::types::{ConnectionState, MetricsUpdate};

    fn store_with(ids: &[&str]) -> Arc<ConnectionStore> {
        let store = Arc::new(ConnectionStore::new(StoreConfig::default()));
        for id in ids {
            store.register(*id, TrafficClass::MarketData);
            store.update_state(id, ConnectionState::Connecting);
            store.update_state(id, ConnectionState::Connected);
        }
        store
    }

    #[test]
    fn test_latency_spike_is_one_high_anomaly() {
        let store = store_with(&["md-1"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        let rx = engine.subscribe();
        let start = Utc::now();

        store.update_metrics("md-1", &MetricsUpdate::latency(100.0));
        for i in 0..20 {
            engine.aggregate_at(start + ChronoDuration::seconds(60 * i));
        }
        assert!(engine.scan_at(start).is_empty());

        store.update_metrics("md-1", &MetricsUpdate::latency(5000.0));
        let anomalies = engine.scan_at(start + ChronoDuration::minutes(20));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::Latency);
        assert_eq!(anomalies[0].severity, AnomalySeverity::High);
        assert_eq!(anomalies[0].confidence, 1.0);
        assert_eq!(rx.try_recv().unwrap().id, anomalies[0].id);
    }

    #[test]
    fn test_no_anomalies_without_baseline() {
        let store = store_with(&["md-1"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        store.update_metrics("md-1", &MetricsUpdate::latency(100.0));
        for _ in 0..5 {
            engine.aggregate();
        }
        store.update_metrics("md-1", &MetricsUpdate::latency(9000.0));
        assert!(engine.scan().is_empty());
        assert!(engine.baseline(TrafficClass::MarketData).is_none());
    }

    #[test]
    fn test_error_rate_critical() {
        let store = store_with(&["md-1", "md-2"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        store.update_metrics(
            "md-1",
            &MetricsUpdate {
                messages_received: Some(100),
                ..Default::default()
            },
        );
        store.update_metrics(
            "md-2",
            &MetricsUpdate {
                messages_received: Some(100),
                ..Default::default()
            },
        );
        for _ in 0..10 {
            engine.aggregate();
        }

        store.update_metrics(
            "md-2",
            &MetricsUpdate {
                errors: Some(60),
                ..Default::default()
            },
        );
        let anomalies = engine.scan();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::ErrorRate);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Critical);
        assert_eq!(anomalies[0].connection_id, "md-2");
    }

    #[test]
    fn test_stability_severity() {
        let store = store_with(&["md-1"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        let severity_for = |reconnects: u64| {
            store.update_metrics(
                "md-1",
                &MetricsUpdate {
                    reconnects: Some(reconnects),
                    ..Default::default()
                },
            );
            engine.scan().first().map(|a| a.severity)
        };

        assert_eq!(severity_for(3), None);
        assert_eq!(severity_for(4), Some(AnomalySeverity::Medium));
        assert_eq!(severity_for(7), Some(AnomalySeverity::High));
        assert_eq!(severity_for(11), Some(AnomalySeverity::Critical));
    }

    #[test]
    fn test_system_health() {
        let store = store_with(&[]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        let health = engine.system_health();
        assert_eq!(health.score, 100.0);
        assert_eq!(health.status, SystemStatus::Good);

        store.register("md-1", TrafficClass::MarketData);
        store.update_state("md-1", ConnectionState::Connecting);
        store.update_metrics(
            "md-1",
            &MetricsUpdate {
                messages_received: Some(10),
                errors: Some(10),
                reconnects: Some(3),
                ..Default::default()
            },
        );
        let health = engine.system_health();
        assert_eq!(health.score, 20.0);
        assert_eq!(health.status, SystemStatus::Poor);
        assert_eq!(engine.connection_health("md-1"), Some(20.0));
    }

    #[test]
    fn test_throughput_and_peak() {
        let store = store_with(&["md-1"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        let start = Utc::now();
        engine.aggregate_at(start);

        store.update_metrics(
            "md-1",
            &MetricsUpdate {
                messages_received: Some(600),
                ..Default::default()
            },
        );
        store.update_state("md-1", ConnectionState::Disconnected);
        let samples = engine.aggregate_at(start + ChronoDuration::seconds(60));
        assert_eq!(samples[0].throughput, 10.0);
        assert_eq!(samples[0].active_connections, 0);
        assert_eq!(samples[0].peak_connections, 1);
        assert_eq!(samples[0].success_ratio, 0.0);
    }

    #[test]
    fn test_capacity_insight_on_growth() {
        let store = store_with(&["md-1"]);
        let engine = AnalyticsEngine::new(AnalyticsConfig::default(), store.clone());
        let start = Utc::now();
        for i in 0..20 {
            engine.aggregate_at(start + ChronoDuration::seconds(i));
        }
        store.register("md-2", TrafficClass::MarketData);
        store.update_state("md-2", ConnectionState::Connecting);
        for i in 20..40 {
            engine.aggregate_at(start + ChronoDuration::seconds(i));
        }

        let insights = engine.capacity_insights();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].metric, "connections");
        assert_eq!(insights[0].growth, 1.0);
        assert_eq!(insights[0].timeframe, "next 24 hours");
    }
}
