//! # feedlink Core
//!
//! Core types, error handling, and configuration for the feedlink connection
//! management layer.
//!
//! This crate provides the foundational building blocks shared by every other
//! feedlink crate:
//!
//! - **Types**: `TrafficClass`, the `ConnectionState` machine, per-connection
//!   `ConnectionMetrics` with derived error rate and health score, the
//!   `ConnectionRecord` owned by the store, and cluster-node bookkeeping.
//! - **Errors**: error enums built with `thiserror`, serializable for reports.
//! - **Configuration**: YAML files with environment variable overrides and
//!   validation.
//!
//! ## Example
//!
//! ```
//! use feedlink_core::types::{ConnectionMetrics, ConnectionState};
//!
//! assert!(ConnectionState::Disconnected.can_transition_to(ConnectionState::Connecting));
//! assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
//!
//! let metrics = ConnectionMetrics::default();
//! assert_eq!(metrics.health_score(), 100.0);
//! ```

pub mod alert;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use alert::{Alert, AlertRule, AlertSeverity, AlertType, NotificationChannel};
pub use config::AppConfig;
pub use error::{FeedlinkError, Result};
pub use types::{
    ClusterNodeInfo, ConnectionId, ConnectionMetrics, ConnectionRecord, ConnectionState,
    HealthCheckResult, MetricsUpdate, NodeId, StrategyKind, TrafficClass,
};
