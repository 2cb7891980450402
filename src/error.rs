//! Error handling - Hierarchical, zero-cost errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// tradepulse error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed order input. Caller's fault, never retried.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Order rejected by a risk rule. Surfaced to the caller, never retried
    /// automatically.
    #[error("Risk rejected: {0}")]
    RiskRejected(String),

    /// Broker adapter failure. Transient failures are reconciled by the
    /// status-poll and stale-order sweeps, not retried inline.
    #[error("Broker: {0}")]
    Broker(String),

    /// Unknown order or adapter. Logged and treated as a no-op.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Market data feed failure. Triggers reconnection with backoff.
    #[error("Feed: {0}")]
    Feed(String),

    /// Configuration errors
    #[error("Config: {0}")]
    Config(String),

    /// Serialization
    #[error("Serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid engine state (stopped, queue closed)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
