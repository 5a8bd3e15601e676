//! # feedlink-client
//!
//! Connection abstraction for long-lived streaming feeds.
//!
//! Every transport (exchange websocket, FIX session, internal bus) implements
//! [`StreamConnection`]. The connection manager drives it through
//! connect/disconnect/send/subscribe and learns what happens on the link from
//! its [`ConnectionEvent`] stream.
//!
//! ## Features
//!
//! - `async-trait` capability interface
//! - Tagged-union lifecycle events over `flume` channels
//! - Auto-reconnect with exponential backoff
//! - Transport-side state and atomic link counters
//! - An in-process [`LoopbackConnection`] for tests and simulations
//!
//! ## Example
//!
//! ```rust
//! use feedlink_client::{LoopbackConnection, StreamConnection};
//! use feedlink_core::TrafficClass;
//!
//! # tokio_test::block_on(async {
//! let conn = LoopbackConnection::named("md-1", TrafficClass::MarketData);
//! assert!(conn.connect().await);
//! assert!(conn.send(bytes::Bytes::from_static(b"ping")).await);
//! # });
//! ```

pub mod client;
pub mod loopback;
pub mod state;

// Re-export commonly used types
pub use client::{
    calculate_backoff, connect_with_retry, ConnectionConfig, ConnectionEvent, HealthCheck,
    HealthStatus, ReconnectConfig, StreamConnection,
};
pub use loopback::LoopbackConnection;
pub use state::{LinkCounters, LinkSnapshot, LinkStatus};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};
