//! Feedlink connection management
//!
//! Lifecycle, selection and monitoring for a fleet of streaming feed
//! connections.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────┐
//!                    │      Integration Manager        │
//!                    │  (manager.rs)                   │
//!                    │  - Register / unregister        │
//!                    │  - Event pumps, reconnects      │
//!                    │  - Broadcast, overview          │
//!                    └──────────┬──────────────────────┘
//!                               │
//!        ┌──────────────┬───────┴──────┬───────────────┐
//!        │              │              │               │
//!  ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐ ┌──────▼───────┐
//!  │   Store    │ │  Balancer  │ │ Analytics  │ │    Alerts    │
//!  │ (store.rs) │ │(balancer.rs│ │(analytics. │ │ (alerts.rs)  │
//!  │ - Records  │ │ strategy.rs│ │   rs)      │ │ - Rules      │
//!  │ - Cluster  │ │ health.rs) │ │ - Samples  │ │ - Cooldowns  │
//!  │ - History  │ │ - Select   │ │ - Baselines│ │ - Notifiers  │
//!  └────────────┘ │ - Adaptive │ │ - Anomalies│ │  (notify.rs) │
//!                 └────────────┘ └────────────┘ └──────────────┘
//!                               │
//!                    ┌──────────▼──────────┐
//!                    │  Task Supervisor    │
//!                    │  (tasks.rs)         │
//!                    └─────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use feedlink_client::{ConnectionConfig, LoopbackConnection};
//! use feedlink_core::{AppConfig, TrafficClass};
//! use feedlink_pool::IntegrationManager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = IntegrationManager::new(AppConfig::default())?;
//!     manager.start()?;
//!
//!     let config = ConnectionConfig::new("md-1", TrafficClass::MarketData)
//!         .connect_on_register(true);
//!     let conn = Arc::new(LoopbackConnection::new(config.clone()));
//!     manager.register_connection(conn, config).await;
//!
//!     if let Some(conn) = manager.get_connection(TrafficClass::MarketData, None)? {
//!         println!("selected {}", conn.id());
//!     }
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod analytics;
pub mod balancer;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod store;
pub mod strategy;
pub mod tasks;

pub use alerts::AlertManager;
pub use analytics::{
    AnalyticsEngine, Anomaly, AnomalyKind, AnomalySeverity, Baseline, CapacityInsight,
    ClassSample, SystemHealth, SystemStatus,
};
pub use balancer::{LoadBalancer, StrategyPerformance};
pub use health::{HealthConfig, HealthTracker};
pub use manager::{ConnectionInfo, IntegrationManager, SystemOverview};
pub use metrics::{
    AlertMetrics, AnalyticsMetrics, MetricsConfig, MetricsExporter, MetricsRegistry,
    MetricsSnapshot, SelectionMetrics, StoreMetrics,
};
pub use notify::{Delivery, NotificationHub, Notifier};
pub use store::{Admission, ClassCounts, ConnectionStore, StoreStats, SweepReport};
pub use strategy::{SelectionContext, SelectionStrategy, StrategyRegistry};
pub use tasks::TaskSupervisor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::alerts::AlertManager;
    pub use crate::analytics::AnalyticsEngine;
    pub use crate::balancer::LoadBalancer;
    pub use crate::manager::IntegrationManager;
    pub use crate::metrics::MetricsRegistry;
    pub use crate::store::ConnectionStore;
}
