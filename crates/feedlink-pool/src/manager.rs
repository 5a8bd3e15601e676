//! Integration Manager
//!
//! One facade over the store, balancer, analytics engine and alert manager.
//! It owns the live connection handles, pumps each connection's event
//! stream into the store, reconnects dropped links and runs the periodic
//! jobs of every component under one task supervisor.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use feedlink_client::{connect_with_retry, ConnectionConfig, ConnectionEvent, StreamConnection};
use feedlink_core::alert::{Alert, AlertRule, AlertSeverity, AlertType};
use feedlink_core::config::AppConfig;
use feedlink_core::error::{FeedlinkError, Result};
use feedlink_core::types::{
    ClusterNodeInfo, ConnectionId, ConnectionMetrics, ConnectionState, HealthCheckResult,
    MetricsUpdate, NodeId, StrategyKind, TrafficClass,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertManager;
use crate::analytics::{AnalyticsEngine, Anomaly, AnomalySeverity, CapacityInsight, SystemHealth};
use crate::balancer::{LoadBalancer, StrategyPerformance};
use crate::metrics::MetricsRegistry;
use crate::notify::NotificationHub;
use crate::store::{ClassCounts, ConnectionStore};
use crate::tasks::TaskSupervisor;

/// Anomalies listed in the system overview.
const OVERVIEW_ANOMALIES: usize = 10;

/// A registered connection handle.
#[derive(Clone)]
struct LiveConnection {
    conn: Arc<dyn StreamConnection>,
    config: Arc<ConnectionConfig>,
    /// Stops the event pump and any reconnect in flight
    token: CancellationToken,
    reconnecting: Arc<AtomicBool>,
}

/// Everything known about one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub class: TrafficClass,
    pub state: ConnectionState,
    pub metrics: ConnectionMetrics,
    pub subscriptions: BTreeSet<String>,
    pub owner: Option<NodeId>,
    pub active: bool,
    pub weight: f64,
    pub health_score: f64,
    pub health_check: Option<HealthCheckResult>,
    /// Transport reports an open link
    pub link_up: bool,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide status report.
#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub total_connections: usize,
    pub active_connections: usize,
    pub by_class: BTreeMap<TrafficClass, ClassCounts>,
    pub by_state: BTreeMap<String, usize>,
    /// Connected or authenticated records over registered records
    pub connection_success_rate: f64,
    pub health: SystemHealth,
    pub cluster_nodes: Vec<ClusterNodeInfo>,
    pub default_strategy: StrategyKind,
    /// Strategy each class currently resolves to
    pub class_strategies: BTreeMap<TrafficClass, StrategyKind>,
    pub strategy_performance: Vec<StrategyPerformance>,
    pub active_alerts: usize,
    pub recent_anomalies: Vec<Anomaly>,
    pub capacity_insights: Vec<CapacityInsight>,
}

/// Facade composing every feedlink component.
pub struct IntegrationManager {
    config: AppConfig,
    store: Arc<ConnectionStore>,
    balancer: Arc<LoadBalancer>,
    analytics: Arc<AnalyticsEngine>,
    alerts: Arc<AlertManager>,
    connections: Arc<DashMap<ConnectionId, LiveConnection>>,
    tasks: Arc<TaskSupervisor>,
    metrics: Arc<MetricsRegistry>,
    started_at: DateTime<Utc>,
    started: AtomicBool,
}

impl IntegrationManager {
    /// Builds every component from configuration and registers this
    /// process as a cluster node.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());

        let store = Arc::new(ConnectionStore::with_metrics(
            config.store.clone(),
            metrics.store(),
        ));
        let balancer = Arc::new(LoadBalancer::with_metrics(
            config.balancer.clone(),
            store.clone(),
            metrics.selection(),
        ));
        let analytics = Arc::new(AnalyticsEngine::with_metrics(
            config.analytics.clone(),
            store.clone(),
            metrics.analytics(),
        ));
        let hub = NotificationHub::from_config(&config.notifications, metrics.alerts())
            .map_err(|e| FeedlinkError::Internal(format!("{e:#}")))?;
        let alerts = Arc::new(AlertManager::new(
            config.alerts.clone(),
            store.clone(),
            hub,
            metrics.alerts(),
        ));

        store.register_cluster_node(
            ClusterNodeInfo::new(config.app.node_id.clone(), config.app.node_address.clone())
                .with_capabilities(TrafficClass::ALL.iter().map(|c| c.as_str())),
        );

        info!(
            node_id = %config.app.node_id,
            default_strategy = config.balancer.default_strategy.as_str(),
            "Integration manager created"
        );

        Ok(Self {
            config,
            store,
            balancer,
            analytics,
            alerts,
            connections: Arc::new(DashMap::new()),
            tasks: Arc::new(TaskSupervisor::new()),
            metrics,
            started_at: Utc::now(),
            started: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn analytics(&self) -> &Arc<AnalyticsEngine> {
        &self.analytics
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Registers a connection and starts pumping its events.
    ///
    /// Returns false for a duplicate id or an id that disagrees with the
    /// connection's own. A connection the store evicts to make room is
    /// disconnected and dropped.
    pub async fn register_connection(
        &self,
        conn: Arc<dyn StreamConnection>,
        config: ConnectionConfig,
    ) -> bool {
        let id = conn.id().to_string();
        if config.id != id {
            warn!(connection_id = %id, config_id = %config.id, "Connection id does not match its config");
            return false;
        }
        if self.connections.contains_key(&id) {
            warn!(connection_id = %id, "Connection already registered");
            return false;
        }
        let admission = self.store.admit(
            id.clone(),
            conn.class(),
            config.record_metadata(),
            config.owner.clone(),
        );
        if !admission.admitted {
            return false;
        }
        if let Some(evicted) = admission.evicted {
            self.release_evicted(&evicted).await;
        }
        if let Some(weight) = config.weight {
            self.balancer.set_weight(&id, weight);
        }

        let live = LiveConnection {
            conn: conn.clone(),
            config: Arc::new(config),
            token: self.tasks.child_token(),
            reconnecting: Arc::new(AtomicBool::new(false)),
        };
        let pump = pump_events(
            self.store.clone(),
            self.tasks.clone(),
            live.clone(),
            conn.events(),
        );
        if let Err(e) = self.tasks.spawn(&format!("events-{id}"), pump) {
            error!(connection_id = %id, error = %e, "Failed to start event pump");
            self.store.remove(&id);
            self.balancer.forget(&id);
            return false;
        }

        let connect_now = live.config.connect_on_register;
        self.connections.insert(id.clone(), live);
        info!(connection_id = %id, class = %conn.class(), "Connection registered");

        if connect_now {
            self.connect(&id).await;
        }
        true
    }

    /// Disconnects and forgets a connection.
    pub async fn unregister_connection(&self, id: &str) -> bool {
        let live = self.connections.remove(id).map(|(_, live)| live);
        if let Some(live) = &live {
            live.token.cancel();
            live.conn.disconnect("unregistered").await;
        }

        let removed = self.store.remove(id);
        self.balancer.forget(id);
        if removed || live.is_some() {
            info!(connection_id = %id, "Connection unregistered");
        }
        removed || live.is_some()
    }

    async fn release_evicted(&self, id: &str) {
        self.balancer.forget(id);
        if let Some((_, live)) = self.connections.remove(id) {
            live.token.cancel();
            live.conn.disconnect("evicted").await;
            info!(connection_id = %id, "Evicted connection released");
        }
    }

    fn live(&self, id: &str) -> Option<LiveConnection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub async fn connect(&self, id: &str) -> bool {
        let Some(live) = self.live(id) else {
            return false;
        };
        // Events from the link drive the record from here on.
        if self.store.state(id) == Some(ConnectionState::Disconnected) {
            self.store.update_state(id, ConnectionState::Connecting);
        }
        live.conn.connect().await
    }

    pub async fn disconnect(&self, id: &str, reason: &str) -> bool {
        let Some(live) = self.live(id) else {
            return false;
        };
        live.conn.disconnect(reason).await;
        true
    }

    pub async fn subscribe(&self, id: &str, channel: &str) -> bool {
        let Some(live) = self.live(id) else {
            return false;
        };
        let subscribed = live.conn.subscribe(channel).await;
        if subscribed {
            self.store.add_subscription(id, channel);
        }
        subscribed
    }

    pub async fn unsubscribe(&self, id: &str, channel: &str) -> bool {
        let Some(live) = self.live(id) else {
            return false;
        };
        let unsubscribed = live.conn.unsubscribe(channel).await;
        if unsubscribed {
            self.store.remove_subscription(id, channel);
        }
        unsubscribed
    }

    /// Best connection for `class` right now.
    pub fn get_connection(
        &self,
        class: TrafficClass,
        strategy: Option<StrategyKind>,
    ) -> Result<Option<Arc<dyn StreamConnection>>> {
        let Some(id) = self.balancer.select(class, strategy)? else {
            return Ok(None);
        };
        Ok(self.live(&id).map(|live| live.conn))
    }

    /// Sends `message` to every registered connection, or those of `class`.
    pub async fn broadcast_message(
        &self,
        message: Bytes,
        class: Option<TrafficClass>,
    ) -> HashMap<ConnectionId, bool> {
        let targets: Vec<(ConnectionId, Arc<dyn StreamConnection>)> = self
            .connections
            .iter()
            .filter(|entry| class.map_or(true, |c| entry.conn.class() == c))
            .map(|entry| (entry.key().clone(), entry.conn.clone()))
            .collect();

        let sends = targets.into_iter().map(|(id, conn)| {
            let message = message.clone();
            async move {
                let len = message.len();
                let sent = conn.send(message).await;
                (id, sent, len)
            }
        });

        let mut results = HashMap::new();
        for (id, sent, len) in join_all(sends).await {
            if sent {
                self.store.record_sent(&id, len);
            }
            results.insert(id, sent);
        }
        debug!(
            targets = results.len(),
            delivered = results.values().filter(|s| **s).count(),
            "Broadcast complete"
        );
        results
    }

    pub fn get_connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        let record = self.store.get(id)?;
        let live = self.live(id);
        let link_up = live.as_ref().is_some_and(|live| live.conn.is_connected());
        let authenticated = live.as_ref().is_some_and(|live| live.conn.is_authenticated());
        Some(ConnectionInfo {
            health_score: record.metrics.health_score(),
            health_check: self.balancer.health().latest(id),
            weight: self.balancer.weight(id),
            link_up,
            authenticated,
            id: record.id,
            class: record.class,
            state: record.state,
            metrics: record.metrics,
            subscriptions: record.subscriptions,
            owner: record.owner,
            active: record.active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Runs a transport health check on every live connection and records
    /// the outcome with the balancer.
    ///
    /// A connection is healthy when its transport reports an operational
    /// status and its record passes the balancer's thresholds.
    pub async fn check_health(&self) -> Vec<HealthCheckResult> {
        check_transports(&self.store, &self.balancer, &self.connections).await
    }

    pub fn get_system_overview(&self) -> SystemOverview {
        let now = Utc::now();
        let stats = self.store.stats();
        let records = self.store.all();
        let usable = records.iter().filter(|r| r.state.is_usable()).count();
        let connection_success_rate = if records.is_empty() {
            0.0
        } else {
            usable as f64 / records.len() as f64
        };

        SystemOverview {
            node_id: self.config.app.node_id.clone(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            total_connections: stats.total_connections,
            active_connections: stats.active_connections,
            by_class: stats.by_class,
            by_state: stats.by_state,
            connection_success_rate,
            health: self.analytics.system_health_at(now),
            cluster_nodes: self.store.cluster_nodes(),
            default_strategy: self.balancer.default_strategy(),
            class_strategies: TrafficClass::ALL
                .into_iter()
                .map(|c| (c, self.balancer.current_strategy(c)))
                .collect(),
            strategy_performance: self.balancer.get_strategy_performance(),
            active_alerts: self.alerts.active_alerts().len(),
            recent_anomalies: self.analytics.recent_anomalies(OVERVIEW_ANOMALIES),
            capacity_insights: self.analytics.capacity_insights(),
        }
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn get_alert_history(&self, hours: u64) -> Vec<Alert> {
        self.alerts.history(hours)
    }

    pub fn resolve_alert(&self, id: &str, note: Option<String>) -> bool {
        self.alerts.resolve(id, note)
    }

    pub fn add_alert_rule(&self, rule: AlertRule) -> Result<()> {
        self.alerts.add_rule(rule)
    }

    pub fn remove_alert_rule(&self, alert_type: AlertType) -> bool {
        self.alerts.remove_rule(alert_type)
    }

    pub fn register_cluster_node(&self, node: ClusterNodeInfo) -> bool {
        self.store.register_cluster_node(node)
    }

    pub fn update_node_heartbeat(&self, node_id: &str, load_factor: Option<f64>) -> bool {
        self.store.update_node_heartbeat(node_id, load_factor)
    }

    pub fn unregister_cluster_node(&self, node_id: &str) -> bool {
        self.store.unregister_cluster_node(node_id)
    }

    /// Starts every periodic job and the anomaly forwarder.
    ///
    /// Fails when called outside a Tokio runtime. Calling it twice is a
    /// no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Integration manager already started");
            return Ok(());
        }
        let result = self.spawn_jobs();
        if result.is_err() {
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    fn spawn_jobs(&self) -> Result<()> {
        let cfg = &self.config;

        let store = self.store.clone();
        let store_metrics = self.metrics.store();
        self.tasks
            .spawn_periodic("store-cleanup", cfg.store.cleanup_interval(), move || {
                let store = store.clone();
                let store_metrics = store_metrics.clone();
                async move {
                    let report = store.sweep_stale();
                    store_metrics.update_gauges(&store.stats());
                    if !report.deactivated.is_empty() || !report.expired_nodes.is_empty() {
                        info!(
                            deactivated = report.deactivated.len(),
                            expired_nodes = report.expired_nodes.len(),
                            "Stale sweep finished"
                        );
                    }
                    Ok(())
                }
            })?;

        let store = self.store.clone();
        let balancer = self.balancer.clone();
        let connections = self.connections.clone();
        self.tasks.spawn_periodic(
            "health-check",
            cfg.balancer.health_check_interval(),
            move || {
                let store = store.clone();
                let balancer = balancer.clone();
                let connections = connections.clone();
                async move {
                    let results = check_transports(&store, &balancer, &connections).await;
                    let unhealthy = results.iter().filter(|r| !r.healthy).count();
                    debug!(checked = results.len(), unhealthy, "Health sweep finished");
                    Ok(())
                }
            },
        )?;

        let balancer = self.balancer.clone();
        self.tasks.spawn_periodic(
            "adaptive-rerank",
            cfg.balancer.adaptive_interval(),
            move || {
                let balancer = balancer.clone();
                async move {
                    balancer.rerank_adaptive();
                    Ok(())
                }
            },
        )?;

        let analytics = self.analytics.clone();
        self.tasks.spawn_periodic(
            "analytics-aggregation",
            cfg.analytics.aggregation_interval(),
            move || {
                let analytics = analytics.clone();
                async move {
                    analytics.aggregate();
                    Ok(())
                }
            },
        )?;

        let analytics = self.analytics.clone();
        self.tasks.spawn_periodic(
            "anomaly-scan",
            cfg.analytics.anomaly_interval(),
            move || {
                let analytics = analytics.clone();
                async move {
                    analytics.scan();
                    Ok(())
                }
            },
        )?;

        let alerts = self.alerts.clone();
        self.tasks.spawn_periodic(
            "alert-evaluation",
            cfg.alerts.evaluation_interval(),
            move || {
                let alerts = alerts.clone();
                async move {
                    alerts.evaluate().await;
                    Ok(())
                }
            },
        )?;

        let alerts = self.alerts.clone();
        self.tasks.spawn_periodic(
            "alert-cleanup",
            cfg.alerts.cleanup_interval(),
            move || {
                let alerts = alerts.clone();
                async move {
                    alerts.purge_resolved();
                    Ok(())
                }
            },
        )?;

        self.tasks.spawn(
            "anomaly-forwarding",
            forward_anomalies(
                self.analytics.subscribe(),
                self.alerts.clone(),
                self.tasks.token(),
            ),
        )?;

        info!("Integration manager started");
        Ok(())
    }

    /// Stops background work and disconnects every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down integration manager");
        let aborted = self.tasks.shutdown(self.config.app.shutdown_timeout()).await;
        if aborted > 0 {
            warn!(aborted, "Some background tasks were aborted");
        }

        let conns: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.conn.clone())
            .collect();
        join_all(conns.iter().map(|conn| conn.disconnect("shutdown"))).await;
        info!(connections = conns.len(), "Integration manager stopped");
    }
}

/// Applies one link event to the store record.
fn apply_event(store: &ConnectionStore, id: &str, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => drive_to_connected(store, id),
        ConnectionEvent::Authenticated => {
            if store.state(id) != Some(ConnectionState::Authenticated) {
                drive_to_connected(store, id);
                store.update_state(id, ConnectionState::Authenticating);
            }
            store.update_state(id, ConnectionState::Authenticated);
        }
        ConnectionEvent::Disconnected { reason, requested } => {
            debug!(connection_id = %id, %reason, requested, "Link closed");
            store.update_state(id, ConnectionState::Disconnected);
        }
        ConnectionEvent::Message { bytes, latency_ms } => {
            store.record_received(id, bytes.len(), *latency_ms);
        }
        ConnectionEvent::Error { message } => {
            store.update_state(id, ConnectionState::Error);
            store.update_metrics(
                id,
                &MetricsUpdate {
                    last_error: Some(message.clone()),
                    ..Default::default()
                },
            );
        }
        ConnectionEvent::Reconnecting { attempt } => {
            debug!(connection_id = %id, attempt, "Link reconnecting");
            store.record_reconnect(id);
            store.update_state(id, ConnectionState::Reconnecting);
        }
    }
}

/// Walks the state machine from the current state to `Connected`.
fn drive_to_connected(store: &ConnectionStore, id: &str) {
    use ConnectionState::*;

    let Some(state) = store.state(id) else {
        return;
    };
    let path: &[ConnectionState] = match state {
        Connected | Authenticated => &[],
        Connecting => &[Connected],
        Disconnected | Reconnecting => &[Connecting, Connected],
        Error => &[Reconnecting, Connecting, Connected],
        Authenticating => &[Disconnected, Connecting, Connected],
    };
    for next in path {
        store.update_state(id, *next);
    }
}

async fn pump_events(
    store: Arc<ConnectionStore>,
    tasks: Arc<TaskSupervisor>,
    live: LiveConnection,
    events: flume::Receiver<ConnectionEvent>,
) {
    let id = live.conn.id().to_string();
    debug!(connection_id = %id, "Event pump started");

    loop {
        let event = tokio::select! {
            biased;
            _ = live.token.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        apply_event(&store, &id, &event);
        if let ConnectionEvent::Disconnected {
            requested: false, ..
        } = event
        {
            if live.config.reconnect.enabled {
                spawn_reconnect(&store, &tasks, &live);
            }
        }
    }
    debug!(connection_id = %id, "Event pump stopped");
}

fn spawn_reconnect(store: &Arc<ConnectionStore>, tasks: &TaskSupervisor, live: &LiveConnection) {
    if live.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }

    let store = store.clone();
    let live = live.clone();
    let id = live.conn.id().to_string();
    let name = format!("reconnect-{id}");
    let reconnecting = live.reconnecting.clone();

    let job = async move {
        let try_connect = |attempt: u32| {
            let conn = live.conn.clone();
            let store = store.clone();
            let id = id.clone();
            async move {
                debug!(connection_id = %id, attempt, "Reconnect attempt");
                store.update_state(&id, ConnectionState::Reconnecting);
                store.record_reconnect(&id);
                if conn.connect().await {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("connect to {id} failed"))
                }
            }
        };

        tokio::select! {
            _ = live.token.cancelled() => {}
            result = connect_with_retry(try_connect, &live.config.reconnect) => match result {
                Ok(attempts) => info!(connection_id = %id, attempts, "Connection re-established"),
                Err(e) => {
                    error!(connection_id = %id, error = %e, "Giving up on reconnect");
                    store.update_state(&id, ConnectionState::Error);
                }
            }
        }
        live.reconnecting.store(false, Ordering::SeqCst);
    };

    if let Err(e) = tasks.spawn(&name, job) {
        warn!(task = %name, error = %e, "Failed to start reconnect");
        reconnecting.store(false, Ordering::SeqCst);
    }
}

async fn check_transports(
    store: &ConnectionStore,
    balancer: &LoadBalancer,
    connections: &DashMap<ConnectionId, LiveConnection>,
) -> Vec<HealthCheckResult> {
    balancer.health().retain(|id| store.contains(id));

    let targets: Vec<(ConnectionId, Arc<dyn StreamConnection>)> = connections
        .iter()
        .map(|entry| (entry.key().clone(), entry.conn.clone()))
        .collect();
    let checks = targets.into_iter().map(|(id, conn)| async move {
        let started = Instant::now();
        let check = conn.health_check().await;
        (id, check, started.elapsed())
    });

    let now = Utc::now();
    let mut results = Vec::new();
    for (id, check, elapsed) in join_all(checks).await {
        let Some(record) = store.get(&id) else {
            continue;
        };
        if !record.active {
            continue;
        }
        let healthy = check.status.is_operational() && balancer.health().evaluate(&record, now);
        let response_ms = check.rtt.unwrap_or(elapsed).as_secs_f64() * 1000.0;
        if !healthy {
            debug!(
                connection_id = %id,
                status = ?check.status,
                message = check.message.as_deref().unwrap_or(""),
                "Health check failed"
            );
        }
        if let Some(result) = balancer.record_health_check(&id, healthy, response_ms) {
            results.push(result);
        }
    }
    results
}

async fn forward_anomalies(
    anomalies: flume::Receiver<Anomaly>,
    alerts: Arc<AlertManager>,
    token: CancellationToken,
) {
    loop {
        let anomaly = tokio::select! {
            _ = token.cancelled() => break,
            anomaly = anomalies.recv_async() => match anomaly {
                Ok(anomaly) => anomaly,
                Err(_) => break,
            },
        };
        if anomaly.severity != AnomalySeverity::Critical {
            continue;
        }

        let metrics = BTreeMap::from([
            ("value".to_string(), anomaly.value),
            ("expected".to_string(), anomaly.expected),
            ("confidence".to_string(), anomaly.confidence),
        ]);
        alerts
            .raise(
                AlertType::AnomalyDetected,
                AlertSeverity::Critical,
                format!("{} anomaly: {}", anomaly.kind.as_str(), anomaly.description),
                Some(anomaly.connection_id.clone()),
                metrics,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedlink_client::{LoopbackConnection, ReconnectConfig};
    use std::time::Duration;

    fn manager() -> IntegrationManager {
        IntegrationManager::new(AppConfig::default()).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn register(
        manager: &IntegrationManager,
        id: &str,
        class: TrafficClass,
    ) -> Arc<LoopbackConnection> {
        let config = ConnectionConfig::new(id, class).with_reconnect(ReconnectConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..Default::default()
        });
        let conn = Arc::new(LoopbackConnection::new(config.clone()));
        assert!(manager.register_connection(conn.clone(), config).await);
        conn
    }

    #[tokio::test]
    async fn test_events_drive_store_state() {
        let manager = manager();
        let conn = register(&manager, "md-1", TrafficClass::MarketData).await;
        assert_eq!(
            manager.store().state("md-1"),
            Some(ConnectionState::Disconnected)
        );

        assert!(manager.connect("md-1").await);
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        conn.set_latency(Some(15.0));
        conn.inject_message(Bytes::from_static(b"tick"));
        wait_for(|| {
            manager
                .store()
                .get("md-1")
                .is_some_and(|r| r.metrics.messages_received == 1)
        })
        .await;
        assert_eq!(
            manager.store().get("md-1").unwrap().metrics.latency_ms,
            Some(15.0)
        );

        conn.inject_error("checksum mismatch");
        wait_for(|| {
            manager
                .get_connection_info("md-1")
                .is_some_and(|info| info.metrics.last_error.is_some())
        })
        .await;
        let info = manager.get_connection_info("md-1").unwrap();
        assert_eq!(info.state, ConnectionState::Error);
        assert_eq!(info.metrics.errors, 1);
        assert_eq!(info.metrics.last_error.as_deref(), Some("checksum mismatch"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_authenticated_walks_intermediate_states() {
        let manager = manager();
        let config = ConnectionConfig::new("ud-1", TrafficClass::UserData).connect_on_register(true);
        let conn = Arc::new(LoopbackConnection::new(config.clone()).with_authentication());
        assert!(manager.register_connection(conn, config).await);

        wait_for(|| manager.store().state("ud-1") == Some(ConnectionState::Authenticated)).await;
        assert!(manager.get_connection_info("ud-1").unwrap().authenticated);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_uses_transport_status() {
        let manager = manager();
        let md1 = register(&manager, "md-1", TrafficClass::MarketData).await;
        register(&manager, "md-2", TrafficClass::MarketData).await;
        manager.connect("md-1").await;
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        md1.set_latency(Some(8.0));
        let results = manager.check_health().await;
        assert_eq!(results.len(), 2);
        let up = results.iter().find(|r| r.connection_id == "md-1").unwrap();
        assert!(up.healthy);
        assert!((up.response_time_ms - 8.0).abs() < 1e-6);
        // Registered but never connected.
        let down = results.iter().find(|r| r.connection_id == "md-2").unwrap();
        assert!(!down.healthy);

        manager.connect("md-2").await;
        wait_for(|| manager.store().state("md-2") == Some(ConnectionState::Connected)).await;
        md1.set_unhealthy(true);
        for _ in 0..3 {
            manager.check_health().await;
        }
        let info = manager.get_connection_info("md-1").unwrap();
        assert!(info.link_up);
        assert_eq!(info.health_check.unwrap().consecutive_failures, 3);
        for _ in 0..4 {
            let chosen = manager
                .get_connection(TrafficClass::MarketData, None)
                .unwrap()
                .unwrap();
            assert_eq!(chosen.id(), "md-2");
        }

        md1.set_unhealthy(false);
        manager.check_health().await;
        assert!(manager.balancer().health().is_selectable("md-1", Utc::now()));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_link_reconnects() {
        let manager = manager();
        let conn = register(&manager, "md-1", TrafficClass::MarketData).await;
        manager.connect("md-1").await;
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        conn.fail_next_connects(2);
        conn.drop_link("peer reset");
        wait_for(|| {
            manager.store().get("md-1").is_some_and(|r| {
                r.state == ConnectionState::Connected && r.metrics.reconnects == 3
            })
        })
        .await;
        assert!(conn.is_connected());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_requested_disconnect_does_not_reconnect() {
        let manager = manager();
        let conn = register(&manager, "md-1", TrafficClass::MarketData).await;
        manager.connect("md-1").await;
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        assert!(manager.disconnect("md-1", "maintenance").await);
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Disconnected)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_connected());
        assert_eq!(manager.store().get("md-1").unwrap().metrics.reconnects, 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_mismatched_registration() {
        let manager = manager();
        register(&manager, "md-1", TrafficClass::MarketData).await;

        let config = ConnectionConfig::new("md-1", TrafficClass::MarketData);
        let dup = Arc::new(LoopbackConnection::new(config.clone()));
        assert!(!manager.register_connection(dup, config).await);

        let conn = Arc::new(LoopbackConnection::named("md-2", TrafficClass::MarketData));
        let other = ConnectionConfig::new("md-3", TrafficClass::MarketData);
        assert!(!manager.register_connection(conn, other).await);
    }

    #[tokio::test]
    async fn test_broadcast_and_selection() {
        let manager = manager();
        let md1 = register(&manager, "md-1", TrafficClass::MarketData).await;
        let md2 = register(&manager, "md-2", TrafficClass::MarketData).await;
        register(&manager, "tr-1", TrafficClass::Trading).await;
        manager.connect("md-1").await;
        manager.connect("tr-1").await;
        wait_for(|| manager.store().state("tr-1") == Some(ConnectionState::Connected)).await;
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        let results = manager
            .broadcast_message(Bytes::from_static(b"hello"), Some(TrafficClass::MarketData))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["md-1"], true);
        assert_eq!(results["md-2"], false);
        assert_eq!(md1.sent_messages().len(), 1);
        assert!(md2.sent_messages().is_empty());
        assert_eq!(manager.store().get("md-1").unwrap().metrics.messages_sent, 1);

        let chosen = manager
            .get_connection(TrafficClass::MarketData, None)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.id(), "md-1");
        assert!(manager
            .get_connection(TrafficClass::System, None)
            .unwrap()
            .is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscriptions_and_unregister() {
        let manager = manager();
        let conn = register(&manager, "ud-1", TrafficClass::UserData).await;
        assert!(!manager.subscribe("ud-1", "orders").await);
        manager.connect("ud-1").await;
        assert!(manager.subscribe("ud-1", "orders").await);
        assert!(manager
            .get_connection_info("ud-1")
            .unwrap()
            .subscriptions
            .contains("orders"));
        assert!(manager.unsubscribe("ud-1", "orders").await);

        assert!(manager.unregister_connection("ud-1").await);
        assert!(!conn.is_connected());
        assert!(manager.get_connection_info("ud-1").is_none());
        assert!(!manager.unregister_connection("ud-1").await);
        assert!(!manager.connect("ud-1").await);
    }

    #[tokio::test]
    async fn test_overview_and_cluster() {
        let manager = manager();
        assert!(manager.register_cluster_node(ClusterNodeInfo::new("node-2", "10.0.0.2")));
        let config = ConnectionConfig::new("md-1", TrafficClass::MarketData).with_owner("node-2");
        let conn = Arc::new(LoopbackConnection::new(config.clone()));
        manager.register_connection(conn, config).await;

        let overview = manager.get_system_overview();
        assert_eq!(overview.node_id, "node-1");
        assert_eq!(overview.total_connections, 1);
        assert_eq!(overview.cluster_nodes.len(), 2);
        let local = overview
            .cluster_nodes
            .iter()
            .find(|n| n.id == "node-1")
            .unwrap();
        assert_eq!(local.capabilities.len(), TrafficClass::ALL.len());
        assert!(local.capabilities.iter().any(|c| c == "market-data"));
        assert_eq!(overview.default_strategy, StrategyKind::RoundRobin);
        assert_eq!(overview.connection_success_rate, 0.0);

        assert!(manager.update_node_heartbeat("node-2", Some(0.5)));
        assert!(manager.unregister_cluster_node("node-2"));
        let info = manager.get_connection_info("md-1").unwrap();
        assert!(!info.active);
        assert_eq!(info.owner, None);
    }

    #[test]
    fn test_start_requires_runtime() {
        let manager = manager();
        let err = manager.start().unwrap_err();
        assert!(matches!(err, FeedlinkError::TaskStart { .. }));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let manager = manager();
        manager.start().unwrap();
        manager.start().unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_critical_anomaly_becomes_alert() {
        let manager = manager();
        manager.start().unwrap();
        register(&manager, "md-1", TrafficClass::MarketData).await;
        manager.connect("md-1").await;
        wait_for(|| manager.store().state("md-1") == Some(ConnectionState::Connected)).await;

        manager.store().update_metrics(
            "md-1",
            &MetricsUpdate {
                reconnects: Some(12),
                ..Default::default()
            },
        );
        manager.analytics().scan();
        wait_for(|| {
            manager
                .get_active_alerts()
                .iter()
                .any(|a| a.alert_type == AlertType::AnomalyDetected)
        })
        .await;
        manager.shutdown().await;
    }
}
