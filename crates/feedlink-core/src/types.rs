//! Core types for the feedlink connection management layer.
//!
//! This module defines the fundamental types used throughout the system:
//! traffic classes, the connection lifecycle state machine, per-connection
//! metrics, the record the connection store owns, and cluster-node
//! bookkeeping.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a connection.
///
/// Opaque to the core; chosen by whoever registers the connection and
/// immutable for the lifetime of the record.
pub type ConnectionId = String;

/// Unique identifier for a cluster node.
pub type NodeId = String;

/// Latency above which a connection loses health points.
pub const HEALTH_LATENCY_LIMIT_MS: f64 = 1000.0;

/// Logical category of traffic a connection serves.
///
/// Selection and aggregation are always scoped to one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrafficClass {
    /// Public market data (books, trades, tickers)
    MarketData,
    /// Private account events (balances, order updates)
    UserData,
    /// Order entry
    Trading,
    /// Internal/system traffic
    System,
}

impl TrafficClass {
    /// All classes, in a stable order.
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::MarketData,
        TrafficClass::UserData,
        TrafficClass::Trading,
        TrafficClass::System,
    ];

    /// Returns the wire/config name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::MarketData => "market-data",
            TrafficClass::UserData => "user-data",
            TrafficClass::Trading => "trading",
            TrafficClass::System => "system",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "market-data" => Ok(TrafficClass::MarketData),
            "user-data" => Ok(TrafficClass::UserData),
            "trading" => Ok(TrafficClass::Trading),
            "system" => Ok(TrafficClass::System),
            other => Err(format!("unknown traffic class: {other}")),
        }
    }
}

/// Lifecycle state of a connection.
///
/// ```text
/// Disconnected ──▶ Connecting ──▶ Connected ──▶ Authenticating ──▶ Authenticated
///      ▲  │            ▲
///      │  ▼            │
///      │ Reconnecting ─┘        any ──▶ Error ──▶ Reconnecting
///      └──────────────── any (graceful close)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Transport established
    Connected,
    /// Authentication handshake in progress
    Authenticating,
    /// Authenticated session
    Authenticated,
    /// Waiting to retry after a failure or drop
    Reconnecting,
    /// Failed; needs a reconnect to recover
    Error,
}

impl ConnectionState {
    /// Returns true if moving from `self` to `next` follows the state machine.
    ///
    /// Same-state transitions are accepted so callers can refresh timestamps.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (_, Error)
                | (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Authenticating)
                | (Authenticating, Authenticated)
                | (Error, Reconnecting)
                | (Disconnected, Reconnecting)
                | (Reconnecting, Connecting)
        )
    }

    /// Returns true if the state counts towards "active" queries.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// Returns true if traffic can flow in this state.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Authenticating => write!(f, "Authenticating"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// Per-connection counters and gauges.
///
/// Only the connection store mutates these, so derived bookkeeping (history,
/// timestamps) stays consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Total errors
    pub errors: u64,
    /// Total reconnects
    pub reconnects: u64,
    /// Most recent latency sample in milliseconds
    pub latency_ms: Option<f64>,
    /// Cumulative bytes in both directions
    pub bandwidth_bytes: u64,
    /// Last time anything happened on the connection
    pub last_activity: DateTime<Utc>,
    /// Last error message
    pub last_error: Option<String>,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            messages_sent: 0,
            messages_received: 0,
            errors: 0,
            reconnects: 0,
            latency_ms: None,
            bandwidth_bytes: 0,
            last_activity: Utc::now(),
            last_error: None,
        }
    }
}

impl ConnectionMetrics {
    /// Messages in both directions.
    pub fn total_messages(&self) -> u64 {
        self.messages_sent + self.messages_received
    }

    /// Errors per message, clamped to `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        error_rate(self.errors, self.total_messages())
    }

    /// 0–100 health score.
    ///
    /// Starts at 100, loses `error_rate × 50`, `min(reconnects × 10, 30)`, and
    /// 20 more when latency exceeds one second. Never negative.
    pub fn health_score(&self) -> f64 {
        let mut score = 100.0;
        score -= self.error_rate() * 50.0;
        score -= (self.reconnects as f64 * 10.0).min(30.0);
        if self.latency_ms.is_some_and(|l| l > HEALTH_LATENCY_LIMIT_MS) {
            score -= 20.0;
        }
        score.max(0.0)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> ChronoDuration {
        now.signed_duration_since(self.last_activity)
    }
}

/// Errors per message, clamped to `[0, 1]`.
///
/// Errors without any traffic count as a full error rate.
pub fn error_rate(errors: u64, messages: u64) -> f64 {
    if errors == 0 {
        0.0
    } else if messages == 0 {
        1.0
    } else {
        (errors as f64 / messages as f64).min(1.0)
    }
}

/// Partial metrics update; `Some` fields overwrite the stored values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub messages_sent: Option<u64>,
    pub messages_received: Option<u64>,
    pub errors: Option<u64>,
    pub reconnects: Option<u64>,
    pub latency_ms: Option<f64>,
    pub bandwidth_bytes: Option<u64>,
    pub last_error: Option<String>,
}

impl MetricsUpdate {
    /// Sets the latency gauge.
    pub fn latency(latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ..Default::default()
        }
    }

    /// Merges the set fields into `metrics` and stamps activity.
    pub fn apply(&self, metrics: &mut ConnectionMetrics, now: DateTime<Utc>) {
        if let Some(v) = self.messages_sent {
            metrics.messages_sent = v;
        }
        if let Some(v) = self.messages_received {
            metrics.messages_received = v;
        }
        if let Some(v) = self.errors {
            metrics.errors = v;
        }
        if let Some(v) = self.reconnects {
            metrics.reconnects = v;
        }
        if let Some(v) = self.latency_ms {
            metrics.latency_ms = Some(v);
        }
        if let Some(v) = self.bandwidth_bytes {
            metrics.bandwidth_bytes = v;
        }
        if let Some(ref v) = self.last_error {
            metrics.last_error = Some(v.clone());
        }
        metrics.last_activity = now;
    }
}

/// One point in a connection's metrics history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub metrics: ConnectionMetrics,
}

/// Counter deltas over an evaluation window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsWindow {
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
}

impl MetricsWindow {
    /// Errors per message within the window.
    pub fn error_rate(&self) -> f64 {
        error_rate(self.errors, self.messages)
    }
}

/// Everything the store knows about one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Unique, immutable identifier
    pub id: ConnectionId,
    /// Traffic class served
    pub class: TrafficClass,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Current metrics
    pub metrics: ConnectionMetrics,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Owning cluster node
    pub owner: Option<NodeId>,
    /// Subscribed channels
    pub subscriptions: BTreeSet<String>,
    /// Free-form metadata (endpoint, labels, ...)
    pub metadata: HashMap<String, String>,
    /// Cleared when the record is deactivated
    pub active: bool,
    /// Why the record was deactivated
    pub deactivation_reason: Option<String>,
    /// Registration order within the store
    pub seq: u64,
    /// Bounded metrics history, oldest first
    pub history: VecDeque<MetricsHistoryEntry>,
}

impl ConnectionRecord {
    /// Creates a new record in the `Disconnected` state.
    pub fn new(id: ConnectionId, class: TrafficClass, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            class,
            state: ConnectionState::Disconnected,
            metrics: ConnectionMetrics {
                last_activity: now,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
            owner: None,
            subscriptions: BTreeSet::new(),
            metadata: HashMap::new(),
            active: true,
            deactivation_reason: None,
            seq,
            history: VecDeque::new(),
        }
    }

    /// Returns true if the record counts as an active connection.
    pub fn is_active(&self) -> bool {
        self.active && self.state.is_active()
    }

    /// Returns true if the record may be evicted to make room.
    pub fn is_evictable(&self) -> bool {
        !self.is_active()
    }

    /// Counter growth within `window` ending at `now`.
    ///
    /// With no history from before the window the lifetime totals are
    /// returned.
    pub fn window_delta(&self, window: ChronoDuration, now: DateTime<Utc>) -> MetricsWindow {
        let start = now - window;
        let current = &self.metrics;

        // The newest entry older than the window holds the counters as of
        // the window start.
        let reference = self.history.iter().rev().find(|e| e.timestamp < start);

        match reference {
            Some(entry) if self.created_at < start => {
                let base = &entry.metrics;
                MetricsWindow {
                    messages: current
                        .total_messages()
                        .saturating_sub(base.total_messages()),
                    errors: current.errors.saturating_sub(base.errors),
                    reconnects: current.reconnects.saturating_sub(base.reconnects),
                }
            }
            _ => MetricsWindow {
                messages: current.total_messages(),
                errors: current.errors,
                reconnects: current.reconnects,
            },
        }
    }
}

/// Bookkeeping entry for a process that may own connections.
///
/// Single-process bookkeeping only; nodes are not consensus participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    /// Node identity
    pub id: NodeId,
    /// Reachable address
    pub address: String,
    /// Advertised capabilities (traffic classes, features)
    pub capabilities: Vec<String>,
    /// Reported load, 0.0 = idle
    pub load_factor: f64,
    /// Last heartbeat
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Connections currently owned by this node
    pub connection_count: usize,
}

impl ClusterNodeInfo {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            address: address.into(),
            capabilities: Vec::new(),
            load_factor: 0.0,
            last_heartbeat: now,
            registered_at: now,
            connection_count: 0,
        }
    }

    /// Adds advertised capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Connection selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rotating index per class
    RoundRobin,
    /// Fewest messages sent + received
    LeastConnections,
    /// Fewest messages sent
    LeastLoad,
    /// Random pick proportional to weight
    WeightedRoundRobin,
    /// Lowest recorded latency
    LeastLatency,
    /// Fewest consecutive health-check failures
    HealthBased,
    /// Best-performing strategy, re-ranked periodically
    Adaptive,
}

impl StrategyKind {
    /// Every concrete (non-adaptive) strategy.
    pub const CONCRETE: [StrategyKind; 6] = [
        StrategyKind::RoundRobin,
        StrategyKind::LeastConnections,
        StrategyKind::LeastLoad,
        StrategyKind::WeightedRoundRobin,
        StrategyKind::LeastLatency,
        StrategyKind::HealthBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round-robin",
            StrategyKind::LeastConnections => "least-connections",
            StrategyKind::LeastLoad => "least-load",
            StrategyKind::WeightedRoundRobin => "weighted-round-robin",
            StrategyKind::LeastLatency => "least-latency",
            StrategyKind::HealthBased => "health-based",
            StrategyKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        StrategyKind::CONCRETE
            .into_iter()
            .chain(std::iter::once(StrategyKind::Adaptive))
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown strategy: {s}"))
    }
}

/// Outcome of the most recent health check of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Connection checked
    pub connection_id: ConnectionId,
    /// Whether the connection passed
    pub healthy: bool,
    /// Time the check took, in milliseconds
    pub response_time_ms: f64,
    /// Failed checks in a row, reset by the first healthy result
    pub consecutive_failures: u32,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("least_latency".parse::<StrategyKind>().unwrap(), StrategyKind::LeastLatency);
        assert_eq!("adaptive".parse::<StrategyKind>().unwrap(), StrategyKind::Adaptive);
        assert!("random".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_traffic_class_round_trip() {
        for class in TrafficClass::ALL {
            assert_eq!(class.as_str().parse::<TrafficClass>().unwrap(), class);
        }
        assert_eq!("MARKET_DATA".parse::<TrafficClass>().unwrap(), TrafficClass::MarketData);
        assert!("options".parse::<TrafficClass>().is_err());
    }

    #[test]
    fn test_state_machine_forward_path() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Authenticated));
        assert!(Error.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
    }

    #[test]
    fn test_state_machine_rejects_shortcuts() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Authenticated));
        assert!(!Connecting.can_transition_to(Authenticated));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_any_state_can_fail_or_close() {
        use ConnectionState::*;
        for state in [Disconnected, Connecting, Connected, Authenticating, Authenticated, Reconnecting, Error] {
            assert!(state.can_transition_to(Error));
            assert!(state.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn test_active_states() {
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Error.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(ConnectionState::Authenticated.is_usable());
        assert!(!ConnectionState::Connecting.is_usable());
    }

    #[test]
    fn test_perfect_health_score() {
        let metrics = ConnectionMetrics {
            messages_sent: 500,
            messages_received: 500,
            latency_ms: Some(999.0),
            ..Default::default()
        };
        assert_eq!(metrics.health_score(), 100.0);
    }

    #[test]
    fn test_health_score_penalties() {
        let metrics = ConnectionMetrics {
            messages_sent: 50,
            messages_received: 50,
            errors: 10,
            reconnects: 5,
            latency_ms: Some(1500.0),
            ..Default::default()
        };
        // 100 - 0.1 * 50 - 30 - 20
        assert!((metrics.health_score() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_monotonic() {
        let mut previous = f64::MAX;
        for errors in 0..200 {
            let metrics = ConnectionMetrics {
                messages_received: 100,
                errors,
                ..Default::default()
            };
            let score = metrics.health_score();
            assert!(score <= previous);
            assert!(score >= 0.0);
            previous = score;
        }

        let mut previous = f64::MAX;
        for reconnects in 0..10 {
            let metrics = ConnectionMetrics {
                reconnects,
                ..Default::default()
            };
            let score = metrics.health_score();
            assert!(score <= previous);
            previous = score;
        }
    }

    #[test]
    fn test_error_rate_edges() {
        assert_eq!(error_rate(0, 0), 0.0);
        assert_eq!(error_rate(3, 0), 1.0);
        assert_eq!(error_rate(5, 100), 0.05);
        assert_eq!(error_rate(500, 100), 1.0);
    }

    #[test]
    fn test_metrics_update_merges_only_set_fields() {
        let mut metrics = ConnectionMetrics {
            messages_sent: 10,
            errors: 2,
            ..Default::default()
        };
        let now = Utc::now();
        MetricsUpdate {
            errors: Some(3),
            latency_ms: Some(42.0),
            ..Default::default()
        }
        .apply(&mut metrics, now);

        assert_eq!(metrics.messages_sent, 10);
        assert_eq!(metrics.errors, 3);
        assert_eq!(metrics.latency_ms, Some(42.0));
        assert_eq!(metrics.last_activity, now);
    }

    #[test]
    fn test_window_delta_uses_history() {
        let now = Utc::now();
        let mut record = ConnectionRecord::new("c1".into(), TrafficClass::Trading, 0);
        record.created_at = now - ChronoDuration::hours(2);

        let mut old = record.metrics.clone();
        old.errors = 5;
        old.messages_received = 100;
        record.history.push_back(MetricsHistoryEntry {
            timestamp: now - ChronoDuration::minutes(90),
            metrics: old.clone(),
        });
        old.errors = 6;
        old.messages_received = 150;
        record.history.push_back(MetricsHistoryEntry {
            timestamp: now - ChronoDuration::minutes(10),
            metrics: old,
        });

        record.metrics.errors = 9;
        record.metrics.messages_received = 250;

        let delta = record.window_delta(ChronoDuration::minutes(15), now);
        assert_eq!(delta.errors, 4);
        assert_eq!(delta.messages, 150);

        let fresh = ConnectionRecord::new("c2".into(), TrafficClass::Trading, 1);
        let delta = fresh.window_delta(ChronoDuration::minutes(15), now);
        assert_eq!(delta, MetricsWindow::default());
    }
}
