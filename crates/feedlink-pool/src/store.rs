//! Connection Store
//!
//! Single source of truth for connection records and cluster-node
//! bookkeeping. All indices live behind one `parking_lot::RwLock`, so every
//! mutation of a record and its indices is linearised; readers receive
//! cloned snapshots.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feedlink_core::config::StoreConfig;
use feedlink_core::types::{
    ClusterNodeInfo, ConnectionId, ConnectionMetrics, ConnectionRecord, ConnectionState,
    MetricsHistoryEntry, MetricsUpdate, NodeId, TrafficClass,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::StoreMetrics;

/// Increment helpers append history at most this often.
const HISTORY_SPACING_MS: i64 = 1_000;

/// Per-class record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub total: usize,
    pub active: usize,
}

/// Store statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub by_class: BTreeMap<TrafficClass, ClassCounts>,
    pub by_state: BTreeMap<String, usize>,
    pub cluster_nodes: usize,
}

/// Outcome of one registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// False only for a duplicate id
    pub admitted: bool,
    /// Record dropped to make room
    pub evicted: Option<ConnectionId>,
}

/// Outcome of one staleness sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records deactivated for inactivity
    pub deactivated: Vec<ConnectionId>,
    /// Cluster nodes removed for a missed heartbeat
    pub expired_nodes: Vec<NodeId>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<ConnectionId, ConnectionRecord>,
    by_class: HashMap<TrafficClass, HashSet<ConnectionId>>,
    by_node: HashMap<NodeId, HashSet<ConnectionId>>,
    nodes: HashMap<NodeId, ClusterNodeInfo>,
    next_seq: u64,
}

impl StoreInner {
    fn sorted<'a>(&self, records: impl Iterator<Item = &'a ConnectionRecord>) -> Vec<ConnectionRecord> {
        let mut out: Vec<_> = records.cloned().collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    fn class_records(&self, class: TrafficClass) -> impl Iterator<Item = &ConnectionRecord> {
        self.by_class
            .get(&class)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
    }

    fn detach(&mut self, id: &str) -> Option<ConnectionRecord> {
        let record = self.records.remove(id)?;
        if let Some(ids) = self.by_class.get_mut(&record.class) {
            ids.remove(id);
        }
        if let Some(owner) = &record.owner {
            if let Some(ids) = self.by_node.get_mut(owner) {
                ids.remove(id);
            }
        }
        Some(record)
    }

    /// Oldest record that may be dropped to make room.
    fn eviction_candidate(&self) -> Option<ConnectionId> {
        self.records
            .values()
            .filter(|r| r.is_evictable())
            .min_by_key(|r| (r.updated_at, r.seq))
            .map(|r| r.id.clone())
    }

    fn remove_node(&mut self, node_id: &str, now: DateTime<Utc>) -> Option<Vec<ConnectionId>> {
        self.nodes.remove(node_id)?;
        let owned = self.by_node.remove(node_id).unwrap_or_default();
        let mut owned: Vec<_> = owned.into_iter().collect();
        owned.sort();
        let reason = format!("cluster node {node_id} removed");
        for id in &owned {
            if let Some(record) = self.records.get_mut(id) {
                record.active = false;
                record.deactivation_reason = Some(reason.clone());
                record.owner = None;
                record.updated_at = now;
            }
        }
        Some(owned)
    }
}

fn push_history(record: &mut ConnectionRecord, now: DateTime<Utc>, limit: usize, force: bool) {
    let due = force
        || record.history.back().map_or(true, |last| {
            (now - last.timestamp).num_milliseconds() >= HISTORY_SPACING_MS
        });
    if !due {
        return;
    }
    record.history.push_back(MetricsHistoryEntry {
        timestamp: now,
        metrics: record.metrics.clone(),
    });
    while record.history.len() > limit {
        record.history.pop_front();
    }
}

/// In-memory connection registry shared by every component.
pub struct ConnectionStore {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    metrics: Arc<StoreMetrics>,
}

impl ConnectionStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_metrics(config, Arc::new(StoreMetrics::new()))
    }

    pub fn with_metrics(config: StoreConfig, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            config,
            inner: RwLock::new(StoreInner::default()),
            metrics,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Registers a new record in the `Disconnected` state.
    ///
    /// Returns false for a duplicate id. At capacity the oldest inactive
    /// record is evicted; with nothing evictable the record is admitted
    /// anyway.
    pub fn register(&self, id: impl Into<ConnectionId>, class: TrafficClass) -> bool {
        self.register_with(id, class, HashMap::new(), None)
    }

    /// Registers a record with metadata and an optional owning node.
    ///
    /// An owner that is not a registered cluster node is ignored.
    pub fn register_with(
        &self,
        id: impl Into<ConnectionId>,
        class: TrafficClass,
        metadata: HashMap<String, String>,
        owner: Option<NodeId>,
    ) -> bool {
        self.admit(id, class, metadata, owner).admitted
    }

    /// Like [`Self::register_with`], also reporting which record, if any,
    /// was evicted to make room. Owners of live handles use it to drop the
    /// evicted connection too.
    pub fn admit(
        &self,
        id: impl Into<ConnectionId>,
        class: TrafficClass,
        metadata: HashMap<String, String>,
        owner: Option<NodeId>,
    ) -> Admission {
        let id = id.into();
        let mut inner = self.inner.write();

        if inner.records.contains_key(&id) {
            warn!(connection_id = %id, "Connection already registered");
            return Admission::default();
        }

        let mut evicted = None;
        if inner.records.len() >= self.config.max_connections {
            match inner.eviction_candidate() {
                Some(victim) => {
                    inner.detach(&victim);
                    self.metrics.record_evicted();
                    info!(
                        connection_id = %victim,
                        "Evicted inactive connection to stay within capacity"
                    );
                    evicted = Some(victim);
                }
                None => warn!(
                    connection_id = %id,
                    max_connections = self.config.max_connections,
                    "Connection store over capacity with nothing evictable"
                ),
            }
        }

        let owner = owner.filter(|node| {
            let known = inner.nodes.contains_key(node);
            if !known {
                warn!(connection_id = %id, node_id = %node, "Ignoring unknown owning node");
            }
            known
        });

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut record = ConnectionRecord::new(id.clone(), class, seq);
        record.metadata = metadata;
        record.owner = owner.clone();

        inner.by_class.entry(class).or_default().insert(id.clone());
        if let Some(node) = owner {
            inner.by_node.entry(node).or_default().insert(id.clone());
        }
        inner.records.insert(id.clone(), record);
        drop(inner);

        self.metrics.record_registered(class);
        debug!(connection_id = %id, class = %class, "Connection registered");
        Admission {
            admitted: true,
            evicted,
        }
    }

    /// Moves a record along the state machine.
    ///
    /// Entering `Error` counts one error. Entering `Connected` reactivates a
    /// deactivated record.
    pub fn update_state(&self, id: &str, state: ConnectionState) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };

        let previous = record.state;
        if !previous.can_transition_to(state) {
            warn!(
                connection_id = %id,
                from = %previous,
                to = %state,
                "Rejected invalid state transition"
            );
            return false;
        }

        record.state = state;
        record.updated_at = now;
        if state == ConnectionState::Error && previous != ConnectionState::Error {
            record.metrics.errors += 1;
            record.metrics.last_activity = now;
            push_history(record, now, self.config.history_limit, true);
        }
        if state == ConnectionState::Connected && previous != state && !record.active {
            record.active = true;
            let reason = record.deactivation_reason.take();
            info!(connection_id = %id, previous_reason = ?reason, "Connection reactivated");
        }

        if previous != state {
            debug!(connection_id = %id, from = %previous, to = %state, "State changed");
        }
        true
    }

    /// Merges a partial metrics update and appends a history entry.
    pub fn update_metrics(&self, id: &str, update: &MetricsUpdate) -> bool {
        let now = Utc::now();
        self.mutate(id, now, true, |metrics| update.apply(metrics, now))
    }

    /// Records an outbound message.
    pub fn record_sent(&self, id: &str, bytes: usize) -> bool {
        let now = Utc::now();
        self.mutate(id, now, false, |metrics| {
            metrics.messages_sent += 1;
            metrics.bandwidth_bytes += bytes as u64;
            metrics.last_activity = now;
        })
    }

    /// Records an inbound message with an optional latency sample.
    pub fn record_received(&self, id: &str, bytes: usize, latency_ms: Option<f64>) -> bool {
        let now = Utc::now();
        self.mutate(id, now, false, |metrics| {
            metrics.messages_received += 1;
            metrics.bandwidth_bytes += bytes as u64;
            if latency_ms.is_some() {
                metrics.latency_ms = latency_ms;
            }
            metrics.last_activity = now;
        })
    }

    pub fn record_error(&self, id: &str, message: impl Into<String>) -> bool {
        let now = Utc::now();
        let message = message.into();
        self.mutate(id, now, true, |metrics| {
            metrics.errors += 1;
            metrics.last_error = Some(message);
            metrics.last_activity = now;
        })
    }

    pub fn record_reconnect(&self, id: &str) -> bool {
        let now = Utc::now();
        self.mutate(id, now, true, |metrics| {
            metrics.reconnects += 1;
            metrics.last_activity = now;
        })
    }

    fn mutate<F>(&self, id: &str, now: DateTime<Utc>, force_history: bool, f: F) -> bool
    where
        F: FnOnce(&mut ConnectionMetrics),
    {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };
        f(&mut record.metrics);
        record.updated_at = now;
        push_history(record, now, self.config.history_limit, force_history);
        true
    }

    pub fn add_subscription(&self, id: &str, channel: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };
        record.subscriptions.insert(channel.to_string());
        record.updated_at = Utc::now();
        true
    }

    /// Returns false if the record is unknown or was not subscribed.
    pub fn remove_subscription(&self, id: &str, channel: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };
        let removed = record.subscriptions.remove(channel);
        if removed {
            record.updated_at = Utc::now();
        }
        removed
    }

    /// Marks a record inactive without deleting it.
    pub fn deactivate(&self, id: &str, reason: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };
        record.active = false;
        record.deactivation_reason = Some(reason.to_string());
        record.updated_at = Utc::now();
        info!(connection_id = %id, reason, "Connection deactivated");
        true
    }

    /// Deletes a record and its index entries.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.inner.write().detach(id).is_some();
        if removed {
            self.metrics.record_removed();
            debug!(connection_id = %id, "Connection removed");
        }
        removed
    }

    /// Registers a cluster node. Returns false if the id is taken.
    pub fn register_cluster_node(&self, node: ClusterNodeInfo) -> bool {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&node.id) {
            warn!(node_id = %node.id, "Cluster node already registered");
            return false;
        }
        info!(node_id = %node.id, address = %node.address, "Cluster node registered");
        inner.nodes.insert(node.id.clone(), node);
        true
    }

    /// Removes a node after deactivating every connection it owns.
    pub fn unregister_cluster_node(&self, node_id: &str) -> bool {
        match self.inner.write().remove_node(node_id, Utc::now()) {
            Some(owned) => {
                info!(
                    node_id,
                    deactivated = owned.len(),
                    "Cluster node unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn update_node_heartbeat(&self, node_id: &str, load_factor: Option<f64>) -> bool {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(node_id) else {
            return false;
        };
        node.last_heartbeat = Utc::now();
        if let Some(load) = load_factor {
            node.load_factor = load;
        }
        true
    }

    /// Deactivates stale records and removes nodes that missed their
    /// heartbeat, as of `now`.
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> SweepReport {
        let stale_after = ChronoDuration::seconds(self.config.stale_threshold_secs as i64);
        let node_timeout = ChronoDuration::seconds(self.config.node_timeout_secs as i64);
        let mut report = SweepReport::default();

        {
            let mut inner = self.inner.write();

            for record in inner.records.values_mut() {
                if record.active && now - record.updated_at > stale_after {
                    record.active = false;
                    record.deactivation_reason = Some("stale".to_string());
                    report.deactivated.push(record.id.clone());
                }
            }

            let expired: Vec<NodeId> = inner
                .nodes
                .values()
                .filter(|n| now - n.last_heartbeat > node_timeout)
                .map(|n| n.id.clone())
                .collect();
            for node_id in expired {
                if inner.remove_node(&node_id, now).is_some() {
                    report.expired_nodes.push(node_id);
                }
            }
        }

        report.deactivated.sort();
        if !report.deactivated.is_empty() {
            self.metrics.record_stale(report.deactivated.len());
            info!(count = report.deactivated.len(), "Deactivated stale connections");
        }
        for node_id in &report.expired_nodes {
            warn!(node_id = %node_id, "Cluster node heartbeat expired");
        }
        self.metrics.update_gauges(&self.stats());
        report
    }

    pub fn sweep_stale(&self) -> SweepReport {
        self.sweep_stale_at(Utc::now())
    }

    pub fn get(&self, id: &str) -> Option<ConnectionRecord> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn state(&self, id: &str) -> Option<ConnectionState> {
        self.inner.read().records.get(id).map(|r| r.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, in registration order.
    pub fn all(&self) -> Vec<ConnectionRecord> {
        let inner = self.inner.read();
        inner.sorted(inner.records.values())
    }

    /// Active records, in registration order.
    pub fn active(&self) -> Vec<ConnectionRecord> {
        let inner = self.inner.read();
        inner.sorted(inner.records.values().filter(|r| r.is_active()))
    }

    pub fn active_by_class(&self, class: TrafficClass) -> Vec<ConnectionRecord> {
        let inner = self.inner.read();
        inner.sorted(inner.class_records(class).filter(|r| r.is_active()))
    }

    pub fn by_class(&self, class: TrafficClass) -> Vec<ConnectionRecord> {
        let inner = self.inner.read();
        inner.sorted(inner.class_records(class))
    }

    pub fn by_node(&self, node_id: &str) -> Vec<ConnectionRecord> {
        let inner = self.inner.read();
        let records = inner
            .by_node
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.records.get(id));
        inner.sorted(records)
    }

    /// Registered cluster nodes with their current connection counts.
    pub fn cluster_nodes(&self) -> Vec<ClusterNodeInfo> {
        let inner = self.inner.read();
        let mut nodes: Vec<_> = inner
            .nodes
            .values()
            .map(|node| {
                let mut node = node.clone();
                node.connection_count = inner.by_node.get(&node.id).map_or(0, HashSet::len);
                node
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn cluster_node(&self, node_id: &str) -> Option<ClusterNodeInfo> {
        self.cluster_nodes().into_iter().find(|n| n.id == node_id)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let mut stats = StoreStats {
            total_connections: inner.records.len(),
            cluster_nodes: inner.nodes.len(),
            ..Default::default()
        };

        for record in inner.records.values() {
            let counts = stats.by_class.entry(record.class).or_default();
            counts.total += 1;
            if record.is_active() {
                counts.active += 1;
                stats.active_connections += 1;
            }
            *stats.by_state.entry(record.state.to_string()).or_default() += 1;
        }
        stats
    }
}
