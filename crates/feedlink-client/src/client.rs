use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use feedlink_core::types::{NodeId, TrafficClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Enable auto-reconnect
    pub enabled: bool,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (for exponential backoff)
    pub backoff_multiplier: f64,
    /// Maximum number of reconnect attempts (None = infinite)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

/// Health status of a streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Connection is healthy
    Healthy,
    /// Connection is degraded but operational
    Degraded,
    /// Connection is unhealthy
    Unhealthy,
    /// Connection is disconnected
    Disconnected,
}

impl HealthStatus {
    /// Returns true if the connection can be selected.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Result of a transport-level health check
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Current health status
    pub status: HealthStatus,
    /// Optional message describing the status
    pub message: Option<String>,
    /// Round-trip time (if applicable)
    pub rtt: Option<Duration>,
}

impl HealthCheck {
    pub fn healthy(rtt: Option<Duration>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            rtt,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: HealthStatus::Disconnected,
            message: Some("not connected".to_string()),
            rtt: None,
        }
    }
}

/// Lifecycle and traffic events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport established
    Connected,
    /// Session authenticated
    Authenticated,
    /// Transport closed; `requested` is false when the peer or network dropped it
    Disconnected { reason: String, requested: bool },
    /// Inbound payload, with a latency sample when the transport measured one
    Message { bytes: Bytes, latency_ms: Option<f64> },
    /// Transport or protocol error
    Error { message: String },
    /// Transport is retrying on its own
    Reconnecting { attempt: u32 },
}

impl ConnectionEvent {
    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Authenticated => "authenticated",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::Message { .. } => "message",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Configuration for a streaming connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection id, unique within a process
    pub id: String,
    /// Remote endpoint
    pub endpoint: String,
    /// Traffic class the connection serves
    pub class: TrafficClass,
    /// Auto-reconnect configuration
    pub reconnect: ReconnectConfig,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout
    pub read_timeout: Duration,
    /// Largest payload accepted by `send`
    pub max_message_size: usize,
    /// Static selection weight
    pub weight: Option<f64>,
    /// Owning cluster node
    pub owner: Option<NodeId>,
    /// Free-form metadata copied into the store record
    pub metadata: HashMap<String, String>,
    /// Connect immediately when registered with a manager
    pub connect_on_register: bool,
}

impl ConnectionConfig {
    pub fn new(id: impl Into<String>, class: TrafficClass) -> Self {
        Self {
            id: id.into(),
            class,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_owner(mut self, node: impl Into<NodeId>) -> Self {
        self.owner = Some(node.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn connect_on_register(mut self, connect: bool) -> Self {
        self.connect_on_register = connect;
        self
    }

    /// Metadata for the store record, including the endpoint.
    pub fn record_metadata(&self) -> HashMap<String, String> {
        let mut metadata = self.metadata.clone();
        if !self.endpoint.is_empty() {
            metadata
                .entry("endpoint".to_string())
                .or_insert_with(|| self.endpoint.clone());
        }
        metadata
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            endpoint: String::new(),
            class: TrafficClass::MarketData,
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024,
            weight: None,
            owner: None,
            metadata: HashMap::new(),
            connect_on_register: false,
        }
    }
}

/// Capability interface every streaming transport implements.
///
/// Operations report failure through their return values and the event
/// stream; they never panic.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Connection id
    fn id(&self) -> &str;

    /// Traffic class served
    fn class(&self) -> TrafficClass;

    /// Establish the transport (and authenticate if the transport requires it)
    async fn connect(&self) -> bool;

    /// Close the transport
    async fn disconnect(&self, reason: &str);

    /// Send a payload
    async fn send(&self, payload: Bytes) -> bool;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> bool;

    /// Unsubscribe from a channel
    async fn unsubscribe(&self, channel: &str) -> bool;

    /// Check if the transport is currently connected
    fn is_connected(&self) -> bool;

    /// Check if the session is authenticated
    fn is_authenticated(&self) -> bool;

    /// Perform a health check on the connection
    async fn health_check(&self) -> HealthCheck;

    /// Event stream of the connection
    fn events(&self) -> flume::Receiver<ConnectionEvent>;
}

/// Helper function to calculate exponential backoff duration
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let backoff_secs =
        config.initial_backoff.as_secs_f64() * config.backoff_multiplier.powi(attempt as i32);
    let capped_secs = backoff_secs.min(config.max_backoff.as_secs_f64());
    Duration::from_secs_f64(capped_secs)
}

/// Auto-reconnect helper that wraps connection attempts with retry logic
pub async fn connect_with_retry<F, Fut>(mut connect_fn: F, config: &ReconnectConfig) -> Result<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    if !config.enabled {
        return connect_fn(0).await.map(|_| 0);
    }

    let mut attempt = 0u32;

    loop {
        match connect_fn(attempt).await {
            Ok(()) => {
                if attempt > 0 {
                    info!(attempt, "Successfully reconnected after {} attempts", attempt);
                }
                return Ok(attempt);
            }
            Err(e) => {
                attempt += 1;

                if let Some(max) = config.max_attempts {
                    if attempt >= max {
                        error!(attempt, error = %e, "Max reconnect attempts reached");
                        return Err(e);
                    }
                }

                let backoff = calculate_backoff(attempt - 1, config);
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Connection attempt failed, retrying after backoff"
                );

                tokio::time::sleep(backoff).await;
            }
        }
    }
}
