//! In-process transport.
//!
//! `LoopbackConnection` behaves like a remote feed without a network: sent
//! payloads are captured, inbound traffic is injected by the caller, and
//! failures can be scripted. The CLI harness and the test suites drive the
//! manager with it.

use crate::client::{ConnectionConfig, ConnectionEvent, HealthCheck, HealthStatus, StreamConnection};
use crate::state::LinkStatus;
use async_trait::async_trait;
use bytes::Bytes;
use feedlink_core::types::{ConnectionState, TrafficClass};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Scripted behaviour of a loopback link.
#[derive(Debug, Clone, Default)]
struct Script {
    /// Upcoming connect attempts that fail
    failing_connects: u32,
    /// Every send fails while set
    failing_sends: bool,
    /// Reported round-trip time
    latency_ms: Option<f64>,
    /// Emit `Authenticated` after `Connected`
    authenticate: bool,
    /// Health checks report unhealthy while set
    unhealthy: bool,
}

/// Loopback transport implementing [`StreamConnection`].
pub struct LoopbackConnection {
    config: ConnectionConfig,
    status: LinkStatus,
    events_tx: flume::Sender<ConnectionEvent>,
    events_rx: flume::Receiver<ConnectionEvent>,
    sent: Mutex<Vec<Bytes>>,
    subscriptions: Mutex<BTreeSet<String>>,
    script: Mutex<Script>,
}

impl LoopbackConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            config,
            status: LinkStatus::new(),
            events_tx,
            events_rx,
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
            script: Mutex::new(Script::default()),
        }
    }

    /// Shorthand for a loopback link with default settings.
    pub fn named(id: impl Into<String>, class: TrafficClass) -> Self {
        Self::new(ConnectionConfig::new(id, class))
    }

    /// Emit `Authenticated` after every successful connect.
    pub fn with_authentication(self) -> Self {
        self.script.lock().authenticate = true;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.script.lock().failing_connects = n;
    }

    /// Make every send fail until cleared.
    pub fn set_send_failure(&self, failing: bool) {
        self.script.lock().failing_sends = failing;
    }

    /// Latency attached to injected messages and health checks.
    pub fn set_latency(&self, latency_ms: Option<f64>) {
        self.script.lock().latency_ms = latency_ms;
    }

    /// Make health checks report the link unhealthy.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.script.lock().unhealthy = unhealthy;
    }

    /// Payloads accepted by `send`, oldest first.
    pub fn sent_messages(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Deliver an inbound payload as if it came from the peer.
    pub fn inject_message(&self, payload: impl Into<Bytes>) -> bool {
        if !self.status.is_connected() {
            return false;
        }
        let bytes = payload.into();
        self.status.counters().record_received(bytes.len());
        let latency_ms = self.script.lock().latency_ms;
        self.emit(ConnectionEvent::Message { bytes, latency_ms });
        true
    }

    /// Report a transport error.
    pub fn inject_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.set_error(message.clone());
        self.emit(ConnectionEvent::Error { message });
    }

    /// Drop the link as if the peer went away.
    pub fn drop_link(&self, reason: impl Into<String>) {
        self.status.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.into(),
            requested: false,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        debug!(connection_id = %self.config.id, event = event.kind(), "loopback event");
        if self.events_tx.send(event).is_err() {
            trace!(connection_id = %self.config.id, "No event receiver");
        }
    }
}

#[async_trait]
impl StreamConnection for LoopbackConnection {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn class(&self) -> TrafficClass {
        self.config.class
    }

    async fn connect(&self) -> bool {
        if self.status.is_connected() {
            return true;
        }

        let authenticate = {
            let mut script = self.script.lock();
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                drop(script);
                let message = format!("connection to {} refused", self.config.endpoint);
                warn!(connection_id = %self.config.id, "{}", message);
                self.inject_error(message);
                return false;
            }
            script.authenticate
        };

        self.status.set_state(ConnectionState::Connected);
        self.status.clear_error();
        self.emit(ConnectionEvent::Connected);

        if authenticate {
            self.status.set_state(ConnectionState::Authenticated);
            self.emit(ConnectionEvent::Authenticated);
        }
        true
    }

    async fn disconnect(&self, reason: &str) {
        if self.status.state() == ConnectionState::Disconnected {
            return;
        }
        self.status.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
            requested: true,
        });
    }

    async fn send(&self, payload: Bytes) -> bool {
        if !self.status.is_connected() {
            return false;
        }
        if payload.len() > self.config.max_message_size {
            warn!(
                connection_id = %self.config.id,
                size = payload.len(),
                max = self.config.max_message_size,
                "payload exceeds message size cap"
            );
            return false;
        }
        if self.script.lock().failing_sends {
            self.status.counters().record_error();
            self.emit(ConnectionEvent::Error {
                message: "send failed".to_string(),
            });
            return false;
        }

        self.status.counters().record_sent(payload.len());
        self.sent.lock().push(payload);
        true
    }

    async fn subscribe(&self, channel: &str) -> bool {
        if !self.status.is_connected() {
            return false;
        }
        self.subscriptions.lock().insert(channel.to_string());
        true
    }

    async fn unsubscribe(&self, channel: &str) -> bool {
        self.subscriptions.lock().remove(channel)
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    fn is_authenticated(&self) -> bool {
        self.status.is_authenticated()
    }

    async fn health_check(&self) -> HealthCheck {
        if !self.status.is_connected() {
            return HealthCheck::disconnected();
        }

        let script = self.script.lock().clone();
        let rtt = script
            .latency_ms
            .map(|ms| Duration::from_micros((ms.max(0.0) * 1000.0) as u64));

        if script.unhealthy {
            return HealthCheck {
                status: HealthStatus::Unhealthy,
                message: Some("scripted failure".to_string()),
                rtt,
            };
        }
        HealthCheck::healthy(rtt)
    }

    fn events(&self) -> flume::Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(conn: &LoopbackConnection) -> Vec<ConnectionEvent> {
        conn.events().drain().collect()
    }

    #[tokio::test]
    async fn test_connect_emits_events() {
        let conn = LoopbackConnection::named("md-1", TrafficClass::MarketData).with_authentication();
        assert!(conn.connect().await);
        assert!(conn.is_connected());
        assert!(conn.is_authenticated());
        assert_eq!(
            drain(&conn),
            vec![ConnectionEvent::Connected, ConnectionEvent::Authenticated]
        );
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let conn = LoopbackConnection::named("md-1", TrafficClass::MarketData);
        conn.fail_next_connects(1);

        assert!(!conn.connect().await);
        assert_eq!(conn.status().state(), ConnectionState::Error);
        assert!(matches!(drain(&conn).as_slice(), [ConnectionEvent::Error { .. }]));

        assert!(conn.connect().await);
    }

    #[tokio::test]
    async fn test_send_requires_connection_and_respects_cap() {
        let mut config = ConnectionConfig::new("trade-1", TrafficClass::Trading);
        config.max_message_size = 4;
        let conn = LoopbackConnection::new(config);

        assert!(!conn.send(Bytes::from_static(b"ping")).await);
        conn.connect().await;
        assert!(conn.send(Bytes::from_static(b"ping")).await);
        assert!(!conn.send(Bytes::from_static(b"too long")).await);

        conn.set_send_failure(true);
        assert!(!conn.send(Bytes::from_static(b"pong")).await);
        assert_eq!(conn.sent_messages(), vec![Bytes::from_static(b"ping")]);
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let conn = LoopbackConnection::named("ud-1", TrafficClass::UserData);
        assert!(!conn.subscribe("orders").await);
        conn.connect().await;
        assert!(conn.subscribe("orders").await);
        assert!(conn.subscribe("balances").await);
        assert!(conn.unsubscribe("orders").await);
        assert!(!conn.unsubscribe("orders").await);
        assert_eq!(conn.subscriptions(), vec!["balances".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_and_disconnect_events() {
        let conn = LoopbackConnection::named("md-1", TrafficClass::MarketData);
        conn.connect().await;
        conn.set_latency(Some(12.5));
        assert!(conn.inject_message(Bytes::from_static(b"tick")));
        conn.drop_link("peer reset");
        conn.connect().await;
        conn.disconnect("shutdown").await;

        let events = drain(&conn);
        assert_eq!(
            events[1],
            ConnectionEvent::Message {
                bytes: Bytes::from_static(b"tick"),
                latency_ms: Some(12.5)
            }
        );
        assert_eq!(
            events[2],
            ConnectionEvent::Disconnected {
                reason: "peer reset".to_string(),
                requested: false
            }
        );
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::Disconnected {
                reason: "shutdown".to_string(),
                requested: true
            })
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let conn = LoopbackConnection::named("md-1", TrafficClass::MarketData);
        assert_eq!(conn.health_check().await.status, HealthStatus::Disconnected);

        conn.connect().await;
        conn.set_latency(Some(20.0));
        let check = conn.health_check().await;
        assert_eq!(check.status, HealthStatus::Healthy);
        assert_eq!(check.rtt, Some(Duration::from_millis(20)));

        conn.set_unhealthy(true);
        assert!(!conn.health_check().await.status.is_operational());
    }
}
