//! Order Book - all orders, indexed by user and symbol, with status
//! transitions serialized through a single update entry point.
//!
//! Orders are never deleted; terminal orders are retained for audit and left
//! to an external archiver. Queries return snapshots, never live references.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, OrderEventKind};
use crate::types::{Order, OrderKind, OrderStatus};

/// A fill delta reported by the broker, merged into the order's running
/// weighted average fill price.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub quantity: Decimal,
    pub price: Decimal,
}

struct Inner {
    orders: HashMap<String, Order>,
    user_orders: HashMap<String, Vec<String>>,
    symbol_orders: HashMap<String, Vec<String>>,
    pending: HashSet<String>,
}

pub struct OrderBook {
    inner: RwLock<Inner>,
    bus: Arc<EventBus>,
}

impl OrderBook {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                orders: HashMap::new(),
                user_orders: HashMap::new(),
                symbol_orders: HashMap::new(),
                pending: HashSet::new(),
            }),
            bus,
        }
    }

    /// Validate and register a new order. PENDING orders enter the pending
    /// index. Fails with `InvalidOrder` on malformed input.
    pub fn create(&self, order: Order) -> Result<String> {
        Self::validate(&order)?;

        let id = order.id.clone();
        {
            let mut inner = self.inner.write();
            inner
                .user_orders
                .entry(order.user_id.clone())
                .or_default()
                .push(id.clone());
            inner
                .symbol_orders
                .entry(order.symbol.clone())
                .or_default()
                .push(id.clone());
            if order.status == OrderStatus::Pending {
                inner.pending.insert(id.clone());
            }
            inner.orders.insert(id.clone(), order.clone());
        }

        info!(order_id = %id, symbol = %order.symbol, side = %order.side, "created order");
        self.bus.publish(EngineEvent::Order {
            kind: OrderEventKind::Created,
            order,
        });
        Ok(id)
    }

    /// The only mutator. Merges an optional fill delta, applies the status
    /// transition, and maintains the pending index. Transitions out of a
    /// terminal status are rejected silently to tolerate duplicate or late
    /// broker callbacks. Returns whether the update was applied.
    pub fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        broker_order_id: Option<&str>,
        fill: Option<Fill>,
    ) -> bool {
        let snapshot = {
            let mut inner = self.inner.write();
            let Some(order) = inner.orders.get_mut(order_id) else {
                warn!(order_id, "order not found for status update");
                return false;
            };

            let old_status = order.status;
            if !old_status.can_transition_to(status) {
                if old_status.is_terminal() {
                    debug!(order_id, %old_status, new = %status, "ignoring update to terminal order");
                } else {
                    warn!(order_id, %old_status, new = %status, "rejecting invalid status transition");
                }
                return false;
            }

            if let Some(bid) = broker_order_id
                && order.broker_order_id.is_none()
            {
                order.broker_order_id = Some(bid.to_string());
            }

            if let Some(fill) = fill
                && fill.quantity > Decimal::ZERO
            {
                let remaining = order.quantity - order.filled_quantity;
                let delta = if fill.quantity > remaining {
                    warn!(order_id, reported = %fill.quantity, %remaining, "fill exceeds remaining quantity, clamping");
                    remaining
                } else {
                    fill.quantity
                };
                let prev_filled = order.filled_quantity;
                order.filled_quantity = prev_filled + delta;
                order.avg_fill_price = if prev_filled == Decimal::ZERO {
                    fill.price
                } else {
                    (order.avg_fill_price * prev_filled + fill.price * delta)
                        / order.filled_quantity
                };
            }

            order.status = status;
            order.updated_at = chrono::Utc::now();

            // Leaves the pending index exactly once.
            if old_status == OrderStatus::Pending && status != OrderStatus::Pending {
                inner.pending.remove(order_id);
            }

            let order = &inner.orders[order_id];
            info!(order_id, old = %old_status, new = %status, "updated order status");
            order.clone()
        };

        self.bus.publish(EngineEvent::Order {
            kind: OrderEventKind::Updated,
            order: snapshot,
        });
        true
    }

    /// Cancel an order. No-op returning false for terminal orders.
    pub fn cancel(&self, order_id: &str) -> bool {
        let Some(order) = self.get(order_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        self.update_status(order_id, OrderStatus::Cancelled, None, None)
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.inner.read().orders.get(order_id).cloned()
    }

    /// Orders for a user, newest first, optionally filtered by status.
    pub fn orders_for_user(&self, user_id: &str, status: Option<OrderStatus>) -> Vec<Order> {
        let inner = self.inner.read();
        let mut orders: Vec<Order> = inner
            .user_orders
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.orders.get(id))
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    /// Orders for a symbol; `active_only` keeps PENDING / SUBMITTED /
    /// PARTIALLY_FILLED.
    pub fn orders_for_symbol(&self, symbol: &str, active_only: bool) -> Vec<Order> {
        let inner = self.inner.read();
        inner
            .symbol_orders
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.orders.get(id))
            .filter(|o| !active_only || o.is_active())
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> Vec<Order> {
        let inner = self.inner.read();
        inner
            .pending
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .cloned()
            .collect()
    }

    pub fn with_status(&self, status: OrderStatus) -> Vec<Order> {
        let inner = self.inner.read();
        inner
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    fn validate(order: &Order) -> Result<()> {
        if order.symbol.is_empty() {
            return Err(Error::InvalidOrder("symbol is empty".into()));
        }
        if order.quantity <= Decimal::ZERO {
            return Err(Error::InvalidOrder(format!(
                "quantity {} must be positive",
                order.quantity
            )));
        }
        if matches!(order.kind, OrderKind::Limit | OrderKind::StopLimit)
            && order.price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO
        {
            return Err(Error::InvalidOrder(format!(
                "{:?} order requires a positive limit price",
                order.kind
            )));
        }
        if matches!(order.kind, OrderKind::Stop | OrderKind::StopLimit)
            && order.stop_price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO
        {
            return Err(Error::InvalidOrder(format!(
                "{:?} order requires a positive stop price",
                order.kind
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn book() -> OrderBook {
        OrderBook::new(Arc::new(EventBus::new()))
    }

    fn dec(n: i64) -> Decimal {
        Decimal::from(n)
    }

    #[test]
    fn create_then_get_returns_pending_with_zero_fills() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(10)))
            .unwrap();
        let order = book.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.filled_quantity, Decimal::ZERO);
        assert_eq!(book.pending().len(), 1);
    }

    #[test]
    fn create_rejects_malformed_orders() {
        let book = book();
        assert!(book.create(Order::market("u1", "", Side::Buy, dec(1))).is_err());
        assert!(book.create(Order::market("u1", "X", Side::Buy, dec(0))).is_err());

        // Limit without a price.
        let bad_limit = Order::new("u1", "X", Side::Buy, dec(1), OrderKind::Limit);
        assert!(book.create(bad_limit).is_err());

        // Stop without a stop price.
        let bad_stop = Order::new("u1", "X", Side::Sell, dec(1), OrderKind::Stop);
        assert!(book.create(bad_stop).is_err());
    }

    #[test]
    fn fill_merge_keeps_weighted_average_in_range() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(10)))
            .unwrap();
        book.update_status(&id, OrderStatus::Submitted, Some("B1"), None);
        book.update_status(
            &id,
            OrderStatus::PartiallyFilled,
            None,
            Some(Fill { quantity: dec(4), price: dec(100) }),
        );
        book.update_status(
            &id,
            OrderStatus::Filled,
            None,
            Some(Fill { quantity: dec(6), price: dec(110) }),
        );

        let order = book.get(&id).unwrap();
        assert_eq!(order.filled_quantity, dec(10));
        // (4*100 + 6*110) / 10 = 106
        assert_eq!(order.avg_fill_price, dec(106));
        assert!(order.avg_fill_price >= dec(100) && order.avg_fill_price <= dec(110));
    }

    #[test]
    fn zero_price_first_fill_still_weights_the_next_fill() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(10)))
            .unwrap();
        book.update_status(&id, OrderStatus::Submitted, Some("B1"), None);
        book.update_status(
            &id,
            OrderStatus::PartiallyFilled,
            None,
            Some(Fill { quantity: dec(4), price: dec(0) }),
        );
        book.update_status(
            &id,
            OrderStatus::Filled,
            None,
            Some(Fill { quantity: dec(6), price: dec(110) }),
        );

        // (4*0 + 6*110) / 10 = 66, not 110.
        assert_eq!(book.get(&id).unwrap().avg_fill_price, dec(66));
    }

    #[test]
    fn cumulative_fill_never_exceeds_quantity() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(10)))
            .unwrap();
        book.update_status(&id, OrderStatus::Submitted, None, None);
        book.update_status(
            &id,
            OrderStatus::PartiallyFilled,
            None,
            Some(Fill { quantity: dec(8), price: dec(100) }),
        );
        // Broker over-reports: delta clamped to the remaining 2.
        book.update_status(
            &id,
            OrderStatus::Filled,
            None,
            Some(Fill { quantity: dec(5), price: dec(100) }),
        );
        assert_eq!(book.get(&id).unwrap().filled_quantity, dec(10));
    }

    #[test]
    fn cancel_twice_is_false_the_second_time() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(1)))
            .unwrap();
        assert!(book.cancel(&id));
        let cancelled_at = book.get(&id).unwrap().updated_at;
        assert!(!book.cancel(&id));
        let order = book.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.updated_at, cancelled_at);
    }

    #[test]
    fn terminal_order_ignores_late_broker_callbacks() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(1)))
            .unwrap();
        book.update_status(&id, OrderStatus::Submitted, None, None);
        book.update_status(&id, OrderStatus::Cancelled, None, None);
        // Duplicate/late fill callback after cancel is dropped.
        assert!(!book.update_status(
            &id,
            OrderStatus::Filled,
            None,
            Some(Fill { quantity: dec(1), price: dec(50) }),
        ));
        let order = book.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_quantity, Decimal::ZERO);
    }

    #[test]
    fn pending_index_leaves_exactly_once() {
        let book = book();
        let id = book
            .create(Order::market("u1", "X", Side::Buy, dec(1)))
            .unwrap();
        assert_eq!(book.pending().len(), 1);
        book.update_status(&id, OrderStatus::Submitted, None, None);
        assert!(book.pending().is_empty());
        book.update_status(&id, OrderStatus::Filled, None, Some(Fill { quantity: dec(1), price: dec(10) }));
        assert!(book.pending().is_empty());
    }

    #[test]
    fn queries_filter_by_user_symbol_and_status() {
        let book = book();
        let a = book
            .create(Order::market("u1", "X", Side::Buy, dec(1)))
            .unwrap();
        book.create(Order::market("u1", "Y", Side::Sell, dec(2))).unwrap();
        book.create(Order::market("u2", "X", Side::Buy, dec(3))).unwrap();

        assert_eq!(book.orders_for_user("u1", None).len(), 2);
        assert_eq!(book.orders_for_symbol("X", true).len(), 2);

        book.update_status(&a, OrderStatus::Rejected, None, None);
        assert_eq!(book.orders_for_symbol("X", true).len(), 1);
        assert_eq!(
            book.orders_for_user("u1", Some(OrderStatus::Rejected)).len(),
            1
        );
    }
}
