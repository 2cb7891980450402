//! Strategy capability - consumed by the wiring layer, not implemented
//! here. Sizing policy stays with the caller; a signal's confidence is
//! advisory.

use rust_decimal::Decimal;

use crate::types::{SignalDirection, Tick, TradeSignal};

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Inspect a tick and optionally emit a trade signal.
    fn process_tick(&mut self, tick: &Tick) -> Option<TradeSignal>;
}

/// Fires a single long signal the first time the price crosses below the
/// threshold. Used by the demo binary and tests.
pub struct ThresholdStrategy {
    symbol: String,
    buy_below: Decimal,
    fired: bool,
}

impl ThresholdStrategy {
    pub fn new(symbol: impl Into<String>, buy_below: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            buy_below,
            fired: false,
        }
    }
}

impl Strategy for ThresholdStrategy {
    fn name(&self) -> &str {
        "threshold"
    }

    fn process_tick(&mut self, tick: &Tick) -> Option<TradeSignal> {
        if self.fired || tick.symbol != self.symbol || tick.price >= self.buy_below {
            return None;
        }
        self.fired = true;
        Some(TradeSignal {
            symbol: tick.symbol.clone(),
            direction: SignalDirection::Long,
            entry_price: tick.price,
            stop_price: tick.price * Decimal::new(95, 2),
            target_price: tick.price * Decimal::new(110, 2),
            confidence: 0.5,
        })
    }
}
