//! TradePulse - order execution and risk engine
//!
//! Turns trade signals into broker orders while enforcing per-user risk
//! limits, tracking order and position lifecycle, and marking positions
//! to market from streaming data feeds.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod orderbook;
pub mod risk;
pub mod strategy;
pub mod types;

// Re-exports
pub use config::{Config, EngineConfig, FeedConfig};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
pub use ledger::PositionLedger;
pub use orderbook::OrderBook;
pub use risk::{RiskEngine, RiskLimits};
