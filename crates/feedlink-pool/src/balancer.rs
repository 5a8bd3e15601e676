//! Load Balancer
//!
//! Chooses the connection that should serve a traffic class right now.
//! Candidates are the active records of the class, narrowed to those the
//! health tracker considers selectable (all active records when none is).
//! The chosen strategy comes from the request, a per-class override, or the
//! process default, in that order. `Adaptive` resolves to whichever concrete
//! strategy performed best at the last re-ranking.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use feedlink_core::config::BalancerConfig;
use feedlink_core::error::BalancerError;
use feedlink_core::types::{ConnectionId, HealthCheckResult, StrategyKind, TrafficClass};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::health::{HealthConfig, HealthTracker};
use crate::metrics::SelectionMetrics;
use crate::store::ConnectionStore;
use crate::strategy::{RoundRobin, SelectionContext, SelectionStrategy, StrategyRegistry, DEFAULT_WEIGHT};

/// Floor for the mean response time used in adaptive ranking.
const MIN_RESPONSE_MS: f64 = 0.001;

#[derive(Debug, Clone, Copy)]
struct SelectionSample {
    success: bool,
    elapsed_ms: f64,
}

/// Recent performance of one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyPerformance {
    pub strategy: StrategyKind,
    pub calls: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    /// success_rate / avg_response_ms; higher is better
    pub score: f64,
}

impl StrategyPerformance {
    fn from_samples(strategy: StrategyKind, samples: &VecDeque<SelectionSample>) -> Self {
        let calls = samples.len();
        let failures = samples.iter().filter(|s| !s.success).count();
        let (success_rate, avg_response_ms) = if calls == 0 {
            (0.0, 0.0)
        } else {
            (
                (calls - failures) as f64 / calls as f64,
                samples.iter().map(|s| s.elapsed_ms).sum::<f64>() / calls as f64,
            )
        };
        let score = if calls == 0 {
            0.0
        } else {
            success_rate / avg_response_ms.max(MIN_RESPONSE_MS)
        };

        Self {
            strategy,
            calls,
            failures,
            success_rate,
            avg_response_ms,
            score,
        }
    }
}

/// Strategy-driven connection selector.
pub struct LoadBalancer {
    config: BalancerConfig,
    store: Arc<ConnectionStore>,
    health: HealthTracker,
    registry: StrategyRegistry,
    fallback: RoundRobin,
    weights: RwLock<HashMap<ConnectionId, f64>>,
    performance: RwLock<HashMap<StrategyKind, VecDeque<SelectionSample>>>,
    default_strategy: ArcSwap<StrategyKind>,
    adaptive_choice: ArcSwap<StrategyKind>,
    class_strategies: RwLock<HashMap<TrafficClass, StrategyKind>>,
    metrics: Arc<SelectionMetrics>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig, store: Arc<ConnectionStore>) -> Self {
        Self::with_metrics(config, store, Arc::new(SelectionMetrics::new()))
    }

    pub fn with_metrics(
        config: BalancerConfig,
        store: Arc<ConnectionStore>,
        metrics: Arc<SelectionMetrics>,
    ) -> Self {
        Self {
            health: HealthTracker::new(HealthConfig::from_balancer(&config)),
            registry: StrategyRegistry::with_defaults(),
            fallback: RoundRobin::new(),
            weights: RwLock::new(HashMap::new()),
            performance: RwLock::new(HashMap::new()),
            default_strategy: ArcSwap::from_pointee(config.default_strategy),
            adaptive_choice: ArcSwap::from_pointee(StrategyKind::RoundRobin),
            class_strategies: RwLock::new(config.class_strategies.clone()),
            config,
            store,
            metrics,
        }
    }

    /// Replaces the strategy registry.
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Picks a connection for `class`.
    ///
    /// `Ok(None)` when the class has no active connection. The only error is
    /// a strategy with no registered implementation; a strategy that fails
    /// is recorded and the call degrades to round-robin.
    pub fn select(
        &self,
        class: TrafficClass,
        requested: Option<StrategyKind>,
    ) -> Result<Option<ConnectionId>, BalancerError> {
        let kind = self.resolve(class, requested);
        let strategy = self
            .registry
            .get(kind)
            .ok_or_else(|| BalancerError::unregistered(kind.as_str()))?;

        let active = self.store.active_by_class(class);
        if active.is_empty() {
            debug!(class = %class, "No active connections for class");
            return Ok(None);
        }

        let now = Utc::now();
        let healthy: Vec<_> = active
            .iter()
            .filter(|r| self.health.is_selectable(&r.id, now))
            .cloned()
            .collect();
        let candidates = if healthy.is_empty() {
            debug!(class = %class, "No healthy candidates, using all active connections");
            active
        } else {
            healthy
        };

        let weights = self.weights.read().clone();
        let failures: HashMap<ConnectionId, u32> = candidates
            .iter()
            .map(|r| (r.id.clone(), self.health.consecutive_failures(&r.id)))
            .collect();
        let ctx = SelectionContext {
            class,
            candidates: &candidates,
            weights: &weights,
            failures: &failures,
        };

        let started = Instant::now();
        let outcome = strategy.select(&ctx).and_then(|index| {
            if index < candidates.len() {
                Ok(index)
            } else {
                Err(anyhow::anyhow!("index {index} out of range"))
            }
        });
        let elapsed = started.elapsed();
        self.record_sample(kind, outcome.is_ok(), elapsed.as_secs_f64() * 1000.0);
        self.metrics.record_selection(kind, elapsed);

        let index = match outcome {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    strategy = kind.as_str(),
                    class = %class,
                    error = %e,
                    "Selection strategy failed, falling back to round-robin"
                );
                self.metrics.record_fallback(kind);
                self.fallback.select(&ctx).unwrap_or(0)
            }
        };

        let chosen = candidates[index].id.clone();
        debug!(class = %class, strategy = kind.as_str(), connection_id = %chosen, "Connection selected");
        Ok(Some(chosen))
    }

    /// Concrete strategy a selection for `class` would use.
    pub fn current_strategy(&self, class: TrafficClass) -> StrategyKind {
        self.resolve(class, None)
    }

    fn resolve(&self, class: TrafficClass, requested: Option<StrategyKind>) -> StrategyKind {
        let kind = requested
            .or_else(|| self.class_strategies.read().get(&class).copied())
            .unwrap_or_else(|| **self.default_strategy.load());
        if kind == StrategyKind::Adaptive {
            **self.adaptive_choice.load()
        } else {
            kind
        }
    }

    /// Configured process default, possibly `Adaptive`.
    pub fn default_strategy(&self) -> StrategyKind {
        **self.default_strategy.load()
    }

    pub fn set_default_strategy(&self, kind: StrategyKind) -> Result<(), BalancerError> {
        self.ensure_registered(kind)?;
        let previous = self.default_strategy.swap(Arc::new(kind));
        info!(from = previous.as_str(), to = kind.as_str(), "Default strategy changed");
        Ok(())
    }

    pub fn set_class_strategy(
        &self,
        class: TrafficClass,
        kind: StrategyKind,
    ) -> Result<(), BalancerError> {
        self.ensure_registered(kind)?;
        self.class_strategies.write().insert(class, kind);
        Ok(())
    }

    fn ensure_registered(&self, kind: StrategyKind) -> Result<(), BalancerError> {
        if kind != StrategyKind::Adaptive && self.registry.get(kind).is_none() {
            return Err(BalancerError::unregistered(kind.as_str()));
        }
        Ok(())
    }

    fn record_sample(&self, kind: StrategyKind, success: bool, elapsed_ms: f64) {
        let mut performance = self.performance.write();
        let samples = performance.entry(kind).or_default();
        samples.push_back(SelectionSample {
            success,
            elapsed_ms,
        });
        while samples.len() > self.config.performance_history {
            samples.pop_front();
        }
    }

    /// Checks every active record against the thresholds and records the
    /// results. Transport round trips are measured by the manager.
    pub fn health_sweep_at(&self, now: DateTime<Utc>) -> Vec<HealthCheckResult> {
        let records = self.store.all();
        self.health.retain(|id| records.iter().any(|r| r.id == id));

        records
            .iter()
            .filter(|r| r.active)
            .map(|record| {
                let healthy = self.health.evaluate(record, now);
                if !healthy {
                    self.metrics.record_health_failure();
                }
                // Record-only evaluation, no round trip to time.
                self.health.record(&record.id, healthy, 0.0, now)
            })
            .collect()
    }

    pub fn health_sweep(&self) -> Vec<HealthCheckResult> {
        self.health_sweep_at(Utc::now())
    }

    /// Feeds a result measured against the transport. Unknown ids are ignored.
    pub fn record_health_check(
        &self,
        id: &str,
        healthy: bool,
        response_time_ms: f64,
    ) -> Option<HealthCheckResult> {
        if !self.store.contains(id) {
            return None;
        }
        if !healthy {
            self.metrics.record_health_failure();
        }
        Some(self.health.record(id, healthy, response_time_ms, Utc::now()))
    }

    /// Ranks strategies by recent performance and adopts the best for
    /// `Adaptive`. Returns the choice when any strategy has history.
    pub fn rerank_adaptive(&self) -> Option<StrategyKind> {
        let best = self
            .get_strategy_performance()
            .into_iter()
            .filter(|p| p.calls > 0)
            .fold(None::<StrategyPerformance>, |best, p| match best {
                Some(b) if b.score >= p.score => Some(b),
                _ => Some(p),
            })?;

        let previous = self.adaptive_choice.swap(Arc::new(best.strategy));
        if *previous != best.strategy {
            info!(
                from = previous.as_str(),
                to = best.strategy.as_str(),
                score = best.score,
                "Adaptive strategy switched"
            );
        }
        self.metrics.record_adaptive_choice(best.strategy);
        Some(best.strategy)
    }

    /// Performance of every registered strategy.
    pub fn get_strategy_performance(&self) -> Vec<StrategyPerformance> {
        let performance = self.performance.read();
        let empty = VecDeque::new();
        self.registry
            .kinds()
            .into_iter()
            .map(|kind| {
                StrategyPerformance::from_samples(kind, performance.get(&kind).unwrap_or(&empty))
            })
            .collect()
    }

    pub fn set_weight(&self, id: &str, weight: f64) {
        self.weights.write().insert(id.to_string(), weight);
    }

    pub fn weight(&self, id: &str) -> f64 {
        self.weights.read().get(id).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    /// Drops weight and health state of a removed connection.
    pub fn forget(&self, id: &str) {
        self.weights.write().remove(id);
        self.health.forget(id);
    }
}
