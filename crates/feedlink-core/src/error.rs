//! Error types for the feedlink connection management layer.
//!
//! Most runtime failures in feedlink are answered locally (unknown ids return
//! `false`/`None`, failed deliveries are logged). The errors defined here
//! cover what remains: configuration problems, connection setup failures
//! surfaced to callers, and programmer errors such as asking the load
//! balancer for a strategy that was never registered.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using FeedlinkError as the error type.
pub type Result<T> = std::result::Result<T, FeedlinkError>;

/// Top-level error type for all feedlink operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FeedlinkError {
    /// Connection-related errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Load balancer errors
    #[error("Balancer error: {0}")]
    Balancer(#[from] BalancerError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Background task could not be started
    #[error("Failed to start background task '{task}': {reason}")]
    TaskStart { task: String, reason: String },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for FeedlinkError {
    fn from(err: io::Error) -> Self {
        FeedlinkError::Io {
            message: err.to_string(),
        }
    }
}

/// Errors related to individual connections.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConnectionError {
    /// Failed to establish a connection
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Unknown connection id
    #[error("Connection not found: {id}")]
    NotFound { id: String },

    /// A connection with this id is already registered
    #[error("Connection already registered: {id}")]
    AlreadyRegistered { id: String },

    /// Message exceeds the configured size cap
    #[error("Message of {size} bytes exceeds cap of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Maximum reconnection attempts reached
    #[error("Maximum reconnection attempts ({max_attempts}) reached")]
    MaxReconnectAttemptsReached { max_attempts: u32 },

    /// Connection is not established
    #[error("Not connected")]
    NotConnected,
}

impl ConnectionError {
    /// Creates a connection failed error.
    pub fn failed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed { .. } | ConnectionError::NotConnected
        )
    }
}

/// Errors raised by connection selection.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum BalancerError {
    /// No implementation is registered for the requested strategy
    #[error("No strategy registered for '{strategy}'")]
    UnregisteredStrategy { strategy: String },

    /// A strategy failed while choosing a connection
    #[error("Strategy '{strategy}' failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },
}

impl BalancerError {
    pub fn unregistered(strategy: impl Into<String>) -> Self {
        Self::UnregisteredStrategy {
            strategy: strategy.into(),
        }
    }

    pub fn failed(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StrategyFailed {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }
}

/// Errors related to configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Duplicate connection id
    #[error("Duplicate connection id: {id}")]
    DuplicateConnection { id: String },

    /// Invalid alert rule
    #[error("Invalid alert rule: {reason}")]
    InvalidAlertRule { reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Extension trait for converting Results to FeedlinkError.
pub trait ResultExt<T> {
    /// Converts the error to an internal error with context.
    fn internal_context(self, context: &str) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn internal_context(self, context: &str) -> Result<T> {
        self.map_err(|e| FeedlinkError::Internal(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_transient() {
        let err = ConnectionError::failed("wss://stream.example.com", "refused");
        assert!(err.is_transient());

        let err = ConnectionError::MaxReconnectAttemptsReached { max_attempts: 5 };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_serialization() {
        let err = FeedlinkError::Balancer(BalancerError::unregistered("least-latency"));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Balancer"));
        assert!(json.contains("least-latency"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: FeedlinkError = io_err.into();
        assert!(matches!(err, FeedlinkError::Io { .. }));
    }

    #[test]
    fn test_display() {
        let err = ConnectionError::MessageTooLarge { size: 2048, max: 1024 };
        assert_eq!(err.to_string(), "Message of 2048 bytes exceeds cap of 1024 bytes");
    }

    #[test]
    fn test_result_ext() {
        let parsed: std::result::Result<u16, std::num::ParseIntError> = "x".parse();
        let err = parsed.internal_context("parsing port").unwrap_err();
        assert!(err.to_string().contains("parsing port"));
    }
}
