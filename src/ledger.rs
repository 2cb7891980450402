//! Position Ledger - per-(user, symbol) net quantity, average entry price,
//! and realized/unrealized P&L.
//!
//! The ledger is the sole mutator of positions. `mark_price` is the hot path
//! driven by every market tick and walks only the positions of the ticked
//! symbol via a per-symbol index.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::events::{EngineEvent, EventBus, PositionEventKind};
use crate::types::{Position, Side};

type PositionKey = (String, String); // (user_id, symbol)

/// Realized + unrealized P&L for a user, flat positions included for
/// realized history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlSummary {
    pub realized: Decimal,
    pub unrealized: Decimal,
}

impl PnlSummary {
    pub fn total(&self) -> Decimal {
        self.realized + self.unrealized
    }
}

struct Inner {
    positions: HashMap<PositionKey, Position>,
    user_positions: HashMap<String, Vec<PositionKey>>,
    symbol_positions: HashMap<String, HashSet<PositionKey>>,
}

pub struct PositionLedger {
    inner: RwLock<Inner>,
    bus: Arc<EventBus>,
}

impl PositionLedger {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                user_positions: HashMap::new(),
                symbol_positions: HashMap::new(),
            }),
            bus,
        }
    }

    /// Apply a fill to the (user, symbol) position.
    ///
    /// P&L is realized on the portion that reduces an opposite-sign position
    /// (closing quantity = min(|old|, fill)); the entry price is re-averaged
    /// only on the portion that extends or opens a same-direction position.
    /// A fill crossing through zero re-bases the average at the fill price
    /// for the newly opened remainder.
    pub fn apply_fill(
        &self,
        user_id: &str,
        symbol: &str,
        fill_qty: Decimal,
        fill_price: Decimal,
        side: Side,
    ) {
        let snapshot = {
            let mut inner = self.inner.write();
            let key = (user_id.to_string(), symbol.to_string());
            if !inner.positions.contains_key(&key) {
                inner
                    .user_positions
                    .entry(key.0.clone())
                    .or_default()
                    .push(key.clone());
                inner
                    .symbol_positions
                    .entry(key.1.clone())
                    .or_default()
                    .insert(key.clone());
            }
            let position = inner
                .positions
                .entry(key)
                .or_insert_with(|| Position::new(user_id, symbol));

            let old_qty = position.quantity;
            let old_avg = position.avg_price;
            let signed = match side {
                Side::Buy => fill_qty,
                Side::Sell => -fill_qty,
            };
            let new_qty = old_qty + signed;

            let reduces = old_qty != Decimal::ZERO
                && (old_qty > Decimal::ZERO) != (signed > Decimal::ZERO);
            if reduces {
                let closing = old_qty.abs().min(fill_qty);
                let realized = match side {
                    Side::Sell => closing * (fill_price - old_avg),
                    Side::Buy => closing * (old_avg - fill_price),
                };
                position.realized_pnl += realized;
            }

            position.avg_price = if old_qty == Decimal::ZERO {
                fill_price
            } else if !reduces {
                // Same-direction extension: weighted over absolute sizes.
                (old_qty.abs() * old_avg + fill_qty * fill_price) / new_qty.abs()
            } else if new_qty == Decimal::ZERO {
                Decimal::ZERO
            } else if (new_qty > Decimal::ZERO) != (old_qty > Decimal::ZERO) {
                // Crossed through zero: remainder opens at the fill price.
                fill_price
            } else {
                old_avg
            };

            position.quantity = new_qty;
            position.unrealized_pnl = if new_qty != Decimal::ZERO
                && position.market_price > Decimal::ZERO
            {
                new_qty * (position.market_price - position.avg_price)
            } else {
                Decimal::ZERO
            };
            position.updated_at = Utc::now();

            info!(user_id, symbol, %old_qty, %new_qty, "updated position");
            position.clone()
        };

        self.bus.publish(EngineEvent::Position {
            kind: PositionEventKind::Updated,
            position: snapshot,
        });
    }

    /// Mark every position in `symbol` to the given price, recomputing
    /// unrealized P&L. O(positions in symbol), not O(all positions).
    pub fn mark_price(&self, symbol: &str, price: Decimal) {
        let updated: Vec<Position> = {
            let mut inner = self.inner.write();
            let Some(keys) = inner.symbol_positions.get(symbol).cloned() else {
                return;
            };
            let now = Utc::now();
            let mut updated = Vec::with_capacity(keys.len());
            for key in &keys {
                let Some(position) = inner.positions.get_mut(key) else {
                    continue;
                };
                position.market_price = price;
                position.unrealized_pnl = if position.quantity != Decimal::ZERO {
                    position.quantity * (price - position.avg_price)
                } else {
                    Decimal::ZERO
                };
                position.updated_at = now;
                updated.push(position.clone());
            }
            updated
        };

        for position in updated {
            self.bus.publish(EngineEvent::Position {
                kind: PositionEventKind::PriceUpdate,
                position,
            });
        }
    }

    pub fn position(&self, user_id: &str, symbol: &str) -> Option<Position> {
        self.inner
            .read()
            .positions
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned()
    }

    /// Positions for a user; `active_only` filters to non-flat positions.
    pub fn positions_for_user(&self, user_id: &str, active_only: bool) -> Vec<Position> {
        let inner = self.inner.read();
        inner
            .user_positions
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.positions.get(key))
            .filter(|p| !active_only || p.is_open())
            .cloned()
            .collect()
    }

    /// Realized + unrealized across all of a user's positions, flat ones
    /// included for their realized history.
    pub fn total_pnl(&self, user_id: &str) -> PnlSummary {
        let positions = self.positions_for_user(user_id, false);
        PnlSummary {
            realized: positions.iter().map(|p| p.realized_pnl).sum(),
            unrealized: positions.iter().map(|p| p.unrealized_pnl).sum(),
        }
    }

    /// Users with at least one open position, for the risk sweep.
    pub fn users_with_open_positions(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut users: Vec<String> = inner
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;

    fn ledger() -> PositionLedger {
        PositionLedger::new(Arc::new(EventBus::new()))
    }

    fn dec(n: i64) -> Decimal {
        Decimal::from(n)
    }

    #[test]
    fn quantity_is_signed_sum_of_fills() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        ledger.apply_fill("u1", "X", dec(3), dec(105), Side::Sell);
        ledger.apply_fill("u1", "X", dec(5), dec(102), Side::Buy);

        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, dec(12));
        assert_eq!(pos.side(), PositionSide::Long);
    }

    #[test]
    fn open_then_close_realizes_pnl() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.avg_price, dec(100));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);

        ledger.apply_fill("u1", "X", dec(10), dec(110), Side::Sell);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec(100));
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
        assert_eq!(pos.side(), PositionSide::Flat);
    }

    #[test]
    fn short_close_realizes_with_buy_direction() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Sell);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, dec(-10));
        assert_eq!(pos.avg_price, dec(100));

        // Cover at 90: 10 * (100 - 90) = 100 profit.
        ledger.apply_fill("u1", "X", dec(10), dec(90), Side::Buy);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec(100));
    }

    #[test]
    fn extension_reaverages_entry_price() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        ledger.apply_fill("u1", "X", dec(10), dec(110), Side::Buy);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.avg_price, dec(105));

        // Short extension averages the same way on absolute sizes.
        ledger.apply_fill("u2", "X", dec(10), dec(100), Side::Sell);
        ledger.apply_fill("u2", "X", dec(10), dec(90), Side::Sell);
        let pos = ledger.position("u2", "X").unwrap();
        assert_eq!(pos.quantity, dec(-20));
        assert_eq!(pos.avg_price, dec(95));
    }

    #[test]
    fn partial_reduction_leaves_average_price() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        ledger.apply_fill("u1", "X", dec(4), dec(110), Side::Sell);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, dec(6));
        assert_eq!(pos.avg_price, dec(100));
        assert_eq!(pos.realized_pnl, dec(40));
    }

    #[test]
    fn crossing_zero_rebases_at_fill_price() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(5), dec(100), Side::Buy);
        ledger.apply_fill("u1", "X", dec(8), dec(110), Side::Sell);
        let pos = ledger.position("u1", "X").unwrap();
        assert_eq!(pos.quantity, dec(-3));
        // Realized on the 5 closed: 5 * (110 - 100).
        assert_eq!(pos.realized_pnl, dec(50));
        // The new short remainder opened at the fill price.
        assert_eq!(pos.avg_price, dec(110));
    }

    #[test]
    fn mark_price_updates_unrealized_for_symbol_only() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        ledger.apply_fill("u1", "Y", dec(5), dec(50), Side::Buy);

        ledger.mark_price("X", dec(110));
        assert_eq!(ledger.position("u1", "X").unwrap().unrealized_pnl, dec(100));
        assert_eq!(ledger.position("u1", "Y").unwrap().unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn total_pnl_includes_flat_positions() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(10), dec(100), Side::Buy);
        ledger.apply_fill("u1", "X", dec(10), dec(110), Side::Sell);
        ledger.apply_fill("u1", "Y", dec(5), dec(50), Side::Buy);
        ledger.mark_price("Y", dec(52));

        let pnl = ledger.total_pnl("u1");
        assert_eq!(pnl.realized, dec(100));
        assert_eq!(pnl.unrealized, dec(10));
        assert_eq!(pnl.total(), dec(110));

        // Flat X is excluded from the active view but kept for history.
        assert_eq!(ledger.positions_for_user("u1", true).len(), 1);
        assert_eq!(ledger.positions_for_user("u1", false).len(), 2);
    }

    #[test]
    fn users_with_open_positions_dedupes() {
        let ledger = ledger();
        ledger.apply_fill("u1", "X", dec(1), dec(10), Side::Buy);
        ledger.apply_fill("u1", "Y", dec(1), dec(10), Side::Buy);
        ledger.apply_fill("u2", "X", dec(1), dec(10), Side::Sell);
        assert_eq!(ledger.users_with_open_positions(), vec!["u1", "u2"]);
    }
}
