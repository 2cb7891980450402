//! Typed event bus for order, position, and risk lifecycle events.
//!
//! Delivery is at-least-once and best-effort: publishing never blocks, and a
//! slow or dropped subscriber cannot stall the mutation path that fired the
//! event.

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Order, Position};

/// Order lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Created,
    Updated,
}

/// Position lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEventKind {
    Updated,
    PriceUpdate,
}

/// Risk events emitted by the monitor sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskEventKind {
    StopLossTriggered,
    PositionTimeout,
}

/// Engine event surface
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Order {
        kind: OrderEventKind,
        order: Order,
    },
    Position {
        kind: PositionEventKind,
        position: Position,
    },
    Risk {
        kind: RiskEventKind,
        position: Position,
    },
}

/// Fan-out bus over bounded per-subscriber channels.
pub struct EventBus {
    subscribers: RwLock<Vec<flume::Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber. Events beyond `capacity` that the subscriber
    /// has not drained are dropped, not queued unboundedly.
    pub fn subscribe(&self, capacity: usize) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::bounded(capacity);
        self.subscribers.write().push(tx);
        rx
    }

    /// Publish to every live subscriber. Full or disconnected channels are
    /// skipped; disconnected ones are pruned.
    pub fn publish(&self, event: EngineEvent) {
        let mut dead = false;
        {
            let subs = self.subscribers.read();
            for tx in subs.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        debug!("event subscriber lagging, dropping event");
                    }
                    Err(flume::TrySendError::Disconnected(_)) => dead = true,
                }
            }
        }
        if dead {
            self.subscribers.write().retain(|tx| !tx.is_disconnected());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Order, OrderStatus, Side};
    use rust_decimal::Decimal;

    fn order_event() -> EngineEvent {
        EngineEvent::Order {
            kind: OrderEventKind::Created,
            order: Order::market("u1", "BTC/USDT", Side::Buy, Decimal::from(1)),
        }
    }

    #[test]
    fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe(16);
        bus.publish(order_event());

        match rx.try_recv().unwrap() {
            EngineEvent::Order { kind, order } => {
                assert_eq!(kind, OrderEventKind::Created);
                assert_eq!(order.status, OrderStatus::Pending);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn dropped_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let rx_dead = bus.subscribe(1);
        let rx_live = bus.subscribe(16);
        drop(rx_dead);

        bus.publish(order_event());
        assert!(rx_live.try_recv().is_ok());
        // Disconnected subscriber was pruned.
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn full_subscriber_drops_events_without_blocking() {
        let bus = EventBus::new();
        let rx = bus.subscribe(1);
        bus.publish(order_event());
        bus.publish(order_event());
        // First event delivered, second dropped.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
