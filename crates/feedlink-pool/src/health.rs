//! Health Tracking
//!
//! Keeps the latest health-check result per connection and decides which
//! connections selection may use. A connection with no result yet counts as
//! healthy; repeated failures or an outdated result exclude it until the
//! next passing check.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feedlink_core::config::BalancerConfig;
use feedlink_core::types::{ConnectionId, ConnectionRecord, HealthCheckResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures that exclude a connection
    pub failure_threshold: u32,
    /// Results older than this exclude a connection
    pub stale_after: ChronoDuration,
    /// Connections idle longer than this fail the check
    pub inactivity_threshold: ChronoDuration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_balancer(&BalancerConfig::default())
    }
}

impl HealthConfig {
    pub fn from_balancer(config: &BalancerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            stale_after: ChronoDuration::seconds(config.health_stale_secs as i64),
            inactivity_threshold: ChronoDuration::seconds(config.inactivity_threshold_secs as i64),
        }
    }
}

/// Per-connection health results.
pub struct HealthTracker {
    config: HealthConfig,
    results: RwLock<HashMap<ConnectionId, HealthCheckResult>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            results: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Decides whether a record passes the periodic check.
    ///
    /// Healthy means usable state and activity within the inactivity
    /// threshold.
    pub fn evaluate(&self, record: &ConnectionRecord, now: DateTime<Utc>) -> bool {
        record.state.is_usable() && record.metrics.idle_for(now) <= self.config.inactivity_threshold
    }

    /// Stores a check result.
    ///
    /// Failures accumulate; the first passing check resets the count.
    pub fn record(
        &self,
        id: &str,
        healthy: bool,
        response_time_ms: f64,
        now: DateTime<Utc>,
    ) -> HealthCheckResult {
        let mut results = self.results.write();
        let previous_failures = results.get(id).map_or(0, |r| r.consecutive_failures);
        let consecutive_failures = if healthy { 0 } else { previous_failures + 1 };

        if healthy && previous_failures >= self.config.failure_threshold {
            info!(connection_id = %id, previous_failures, "Connection recovered");
        } else if !healthy && consecutive_failures == self.config.failure_threshold {
            warn!(
                connection_id = %id,
                consecutive_failures,
                "Connection excluded from selection after repeated health check failures"
            );
        } else if !healthy {
            debug!(connection_id = %id, consecutive_failures, "Health check failed");
        }

        let result = HealthCheckResult {
            connection_id: id.to_string(),
            healthy,
            response_time_ms,
            consecutive_failures,
            checked_at: now,
        };
        results.insert(id.to_string(), result.clone());
        result
    }

    /// Returns true if selection may use the connection.
    pub fn is_selectable(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.results.read().get(id) {
            None => true,
            Some(result) => {
                result.consecutive_failures < self.config.failure_threshold
                    && now - result.checked_at <= self.config.stale_after
            }
        }
    }

    pub fn consecutive_failures(&self, id: &str) -> u32 {
        self.results
            .read()
            .get(id)
            .map_or(0, |r| r.consecutive_failures)
    }

    pub fn latest(&self, id: &str) -> Option<HealthCheckResult> {
        self.results.read().get(id).cloned()
    }

    pub fn forget(&self, id: &str) {
        self.results.write().remove(id);
    }

    /// Drops results for connections not in `live`.
    pub fn retain<F>(&self, mut live: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.results.write().retain(|id, _| live(id));
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedlink_core::types::{ConnectionState, TrafficClass};

    #[test]
    fn test_unknown_connection_is_selectable() {
        let tracker = HealthTracker::default();
        assert!(tracker.is_selectable("md-1", Utc::now()));
    }

    #[test]
    fn test_failures_exclude_until_recovery() {
        let tracker = HealthTracker::default();
        let now = Utc::now();

        tracker.record("md-1", false, 1.0, now);
        tracker.record("md-1", false, 1.0, now);
        assert!(tracker.is_selectable("md-1", now));

        let result = tracker.record("md-1", false, 1.0, now);
        assert_eq!(result.consecutive_failures, 3);
        assert!(!tracker.is_selectable("md-1", now));

        let result = tracker.record("md-1", true, 1.0, now);
        assert_eq!(result.consecutive_failures, 0);
        assert!(tracker.is_selectable("md-1", now));
    }

    #[test]
    fn test_stale_result_excludes() {
        let tracker = HealthTracker::default();
        let now = Utc::now();
        tracker.record("md-1", true, 1.0, now);

        assert!(tracker.is_selectable("md-1", now + ChronoDuration::minutes(4)));
        assert!(!tracker.is_selectable("md-1", now + ChronoDuration::minutes(6)));
    }

    #[test]
    fn test_evaluate() {
        let tracker = HealthTracker::default();
        let now = Utc::now();
        let mut record = ConnectionRecord::new("md-1".into(), TrafficClass::MarketData, 0);
        assert!(!tracker.evaluate(&record, now));

        record.state = ConnectionState::Connected;
        assert!(tracker.evaluate(&record, now));
        assert!(!tracker.evaluate(&record, now + ChronoDuration::minutes(11)));
    }

    #[test]
    fn test_forget_and_retain() {
        let tracker = HealthTracker::default();
        let now = Utc::now();
        tracker.record("a", false, 1.0, now);
        tracker.record("b", false, 1.0, now);

        tracker.forget("a");
        assert!(tracker.latest("a").is_none());

        tracker.retain(|id| id != "b");
        assert_eq!(tracker.consecutive_failures("b"), 0);
    }
}
