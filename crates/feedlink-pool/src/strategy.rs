//! Selection strategies.
//!
//! Each strategy picks one candidate out of a non-empty, registration-ordered
//! slice of same-class records. Strategies hold only their own bookkeeping
//! (round-robin cursors); weights and health come in through the context.

use anyhow::{bail, Result};
use feedlink_core::types::{ConnectionId, ConnectionRecord, StrategyKind, TrafficClass};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Default weight for connections without an explicit one.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Everything a strategy may look at.
pub struct SelectionContext<'a> {
    pub class: TrafficClass,
    /// Candidates in registration order
    pub candidates: &'a [ConnectionRecord],
    pub weights: &'a HashMap<ConnectionId, f64>,
    pub failures: &'a HashMap<ConnectionId, u32>,
}

impl SelectionContext<'_> {
    pub fn weight(&self, id: &str) -> f64 {
        self.weights.get(id).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn failures(&self, id: &str) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }
}

/// A connection selection algorithm.
pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Returns the index of the chosen candidate.
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize>;
}

fn ensure_candidates(ctx: &SelectionContext<'_>) -> Result<()> {
    if ctx.candidates.is_empty() {
        bail!("no candidates for {}", ctx.class);
    }
    Ok(())
}

/// Index of the first minimum of `key`.
fn first_min_by<F>(candidates: &[ConnectionRecord], key: F) -> usize
where
    F: Fn(&ConnectionRecord) -> u64,
{
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(i, r)| (key(r), *i))
        .map_or(0, |(i, _)| i)
}

/// Rotating cursor per traffic class.
#[derive(Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<TrafficClass, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(ctx.class).or_insert(0);
        let index = *cursor % ctx.candidates.len();
        *cursor = cursor.wrapping_add(1);
        Ok(index)
    }
}

/// Fewest messages in both directions.
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastConnections
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        Ok(first_min_by(ctx.candidates, |r| r.metrics.total_messages()))
    }
}

/// Fewest messages sent.
pub struct LeastLoad;

impl SelectionStrategy for LeastLoad {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastLoad
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        Ok(first_min_by(ctx.candidates, |r| r.metrics.messages_sent))
    }
}

/// Random pick with probability proportional to weight.
pub struct WeightedRoundRobin;

impl SelectionStrategy for WeightedRoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WeightedRoundRobin
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        let weights: Vec<f64> = ctx
            .candidates
            .iter()
            .map(|r| ctx.weight(&r.id).max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if !(total > 0.0 && total.is_finite()) {
            bail!("candidate weights sum to {total}");
        }

        let mut point = rand::thread_rng().gen_range(0.0..total);
        for (index, weight) in weights.iter().enumerate() {
            if point < *weight {
                return Ok(index);
            }
            point -= weight;
        }
        // Rounding can leave `point` just past the last bucket.
        Ok(weights.iter().rposition(|w| *w > 0.0).unwrap_or(0))
    }
}

/// Lowest recorded latency; the first candidate when none has data.
pub struct LeastLatency;

impl SelectionStrategy for LeastLatency {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastLatency
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        let best = ctx
            .candidates
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.metrics.latency_ms.map(|l| (i, l)))
            .fold(None::<(usize, f64)>, |best, (i, latency)| match best {
                Some((_, current)) if current <= latency => best,
                _ => Some((i, latency)),
            });
        Ok(best.map_or(0, |(i, _)| i))
    }
}

/// Highest score, where score = 100 − 10 × consecutive failures.
pub struct HealthBased;

impl HealthBased {
    pub fn score(failures: u32) -> f64 {
        (100.0 - 10.0 * failures as f64).max(0.0)
    }
}

impl SelectionStrategy for HealthBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HealthBased
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> Result<usize> {
        ensure_candidates(ctx)?;
        let mut best = (0, f64::MIN);
        for (i, record) in ctx.candidates.iter().enumerate() {
            let score = Self::score(ctx.failures(&record.id));
            if score > best.1 {
                best = (i, score);
            }
        }
        Ok(best.0)
    }
}

/// Strategy implementations keyed by kind.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn SelectionStrategy>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding every built-in strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RoundRobin::new()));
        registry.register(Arc::new(LeastConnections));
        registry.register(Arc::new(LeastLoad));
        registry.register(Arc::new(WeightedRoundRobin));
        registry.register(Arc::new(LeastLatency));
        registry.register(Arc::new(HealthBased));
        registry
    }

    /// Adds or replaces the implementation for its kind.
    pub fn register(&mut self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn unregister(&mut self, kind: StrategyKind) -> bool {
        self.strategies.remove(&kind).is_some()
    }

    pub fn get(&self, kind: StrategyKind) -> Option<Arc<dyn SelectionStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
