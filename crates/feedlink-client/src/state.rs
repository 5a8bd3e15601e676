//! Transport-side state and counters.
//!
//! Transports keep their own view of the link here; the authoritative
//! per-connection record lives in the connection store and is fed from
//! the event stream.

use chrono::{DateTime, Utc};
use feedlink_core::types::ConnectionState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Link counters shared by a transport's tasks.
#[derive(Debug)]
pub struct LinkCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU32,
    last_activity: RwLock<DateTime<Utc>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for LinkCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkCounters {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_activity: RwLock::new(Utc::now()),
            connected_at: RwLock::new(None),
        }
    }

    /// Record an outbound message
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record an inbound message
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reconnection attempt, returning the attempt number
    pub fn record_reconnect(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn mark_connected(&self) {
        *self.connected_at.write() = Some(Utc::now());
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.touch();
    }

    pub fn mark_disconnected(&self) {
        *self.connected_at.write() = None;
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_activity: *self.last_activity.read(),
            connected_at: *self.connected_at.read(),
        }
    }
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub reconnect_attempts: u32,
    pub last_activity: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Transport state plus counters.
#[derive(Debug)]
pub struct LinkStatus {
    state: RwLock<ConnectionState>,
    counters: LinkCounters,
    error_message: RwLock<Option<String>>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            counters: LinkCounters::new(),
            error_message: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        match state {
            ConnectionState::Connected => self.counters.mark_connected(),
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.counters.mark_disconnected()
            }
            _ => {}
        }
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    /// Record an error and move to `Error`
    pub fn set_error(&self, error: impl Into<String>) {
        *self.error_message.write() = Some(error.into());
        self.counters.record_error();
        self.set_state(ConnectionState::Error);
    }

    pub fn clear_error(&self) {
        *self.error_message.write() = None;
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_usable()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_recording() {
        let counters = LinkCounters::new();
        counters.record_sent(100);
        counters.record_received(200);
        counters.record_error();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.bytes_received, 200);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.errors, 1);
    }

    #[test]
    fn test_reconnect_attempts_reset_on_connect() {
        let counters = LinkCounters::new();
        assert_eq!(counters.record_reconnect(), 1);
        assert_eq!(counters.record_reconnect(), 2);
        counters.mark_connected();
        assert_eq!(counters.snapshot().reconnect_attempts, 0);
    }

    #[test]
    fn test_link_status() {
        let status = LinkStatus::new();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        assert!(!status.is_connected());

        status.set_state(ConnectionState::Connected);
        assert!(status.is_connected());
        assert!(!status.is_authenticated());

        status.set_error("reset by peer");
        assert_eq!(status.state(), ConnectionState::Error);
        assert_eq!(status.error_message().as_deref(), Some("reset by peer"));
        assert_eq!(status.counters().snapshot().errors, 1);
    }
}
