//! Risk Engine - per-user limits, order validation, and the periodic
//! position monitor that can force-close losing positions.
//!
//! Boundary convention: every limit comparison is a strict "exceeds" (`>`).
//! A value exactly at the limit passes.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, RiskEventKind};
use crate::ledger::PositionLedger;
use crate::types::{Order, Position, Side};

/// Per-user risk configuration.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_position_size: Decimal,
    pub max_daily_loss: Decimal,
    /// Fraction of the day-start portfolio value.
    pub max_drawdown: Decimal,
    pub max_leverage: Decimal,
    pub max_orders_per_minute: usize,
    /// Fraction of portfolio value in a single symbol.
    pub max_concentration: Decimal,
    pub stop_loss_percentage: Decimal,
    pub position_timeout_hours: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::from(1000),
            max_daily_loss: Decimal::from(10_000),
            max_drawdown: Decimal::new(20, 2),
            max_leverage: Decimal::from(3),
            max_orders_per_minute: 10,
            max_concentration: Decimal::new(30, 2),
            stop_loss_percentage: Decimal::new(5, 2),
            position_timeout_hours: 24,
        }
    }
}

/// Overall risk classification, an additive score over drawdown, daily
/// loss, and leverage tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn classify(drawdown: Decimal, daily_pnl: Decimal, leverage: Decimal) -> RiskLevel {
        let mut score = 0;

        if drawdown > Decimal::new(15, 2) {
            score += 3;
        } else if drawdown > Decimal::new(10, 2) {
            score += 2;
        } else if drawdown > Decimal::new(5, 2) {
            score += 1;
        }

        if daily_pnl < Decimal::from(-5000) {
            score += 3;
        } else if daily_pnl < Decimal::from(-2000) {
            score += 2;
        } else if daily_pnl < Decimal::from(-1000) {
            score += 1;
        }

        if leverage > Decimal::new(25, 1) {
            score += 3;
        } else if leverage > Decimal::from(2) {
            score += 2;
        } else if leverage > Decimal::new(15, 1) {
            score += 1;
        }

        match score {
            s if s >= 7 => RiskLevel::Critical,
            s if s >= 5 => RiskLevel::High,
            s if s >= 3 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// Derived, time-windowed snapshot of a user's risk posture. Only the
/// latest snapshot per user is retained.
#[derive(Debug, Clone)]
pub struct RiskMetrics {
    pub drawdown: Decimal,
    pub daily_pnl: Decimal,
    pub portfolio_value: Decimal,
    pub leverage_ratio: Decimal,
    pub largest_position_pct: Decimal,
    pub orders_last_minute: usize,
    pub risk_level: RiskLevel,
}

/// Stop-loss / timeout actions surfaced by the monitor sweep. Forced
/// closes are submitted by the execution engine, not by the risk engine
/// itself.
#[derive(Debug)]
pub enum RiskAction {
    StopLoss { order: Order },
    Timeout { position: Position },
}

/// Fallback symbol-price estimate when an order has no limit price and the
/// position has never been marked.
const FALLBACK_PRICE: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Default portfolio value when the user has no marked positions, so the
/// concentration and leverage ratios stay meaningful.
const DEFAULT_PORTFOLIO_VALUE: Decimal = Decimal::from_parts(100_000, 0, 0, false, 0);

pub struct RiskEngine {
    ledger: Arc<PositionLedger>,
    limits: RwLock<HashMap<String, RiskLimits>>,
    metrics: RwLock<HashMap<String, RiskMetrics>>,
    order_stamps: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    day_start: Mutex<HashMap<String, (NaiveDate, Decimal)>>,
    bus: Arc<EventBus>,
}

impl RiskEngine {
    pub fn new(ledger: Arc<PositionLedger>, bus: Arc<EventBus>) -> Self {
        Self {
            ledger,
            limits: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            order_stamps: Mutex::new(HashMap::new()),
            day_start: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn set_limits(&self, user_id: impl Into<String>, limits: RiskLimits) {
        let user_id = user_id.into();
        info!(%user_id, "updated risk limits");
        self.limits.write().insert(user_id, limits);
    }

    pub fn limits_for(&self, user_id: &str) -> RiskLimits {
        self.limits
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate a candidate order against the user's limits. All five
    /// checks run unconditionally in order; the first failure
    /// short-circuits with a human-readable reason.
    pub fn validate(&self, order: &Order) -> Result<()> {
        let limits = self.limits_for(&order.user_id);

        // 1. Projected position size, direction-aware.
        let current = self
            .ledger
            .position(&order.user_id, &order.symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let projected = match order.side {
            Side::Buy => current + order.quantity,
            Side::Sell => (current - order.quantity).abs(),
        };
        if projected > limits.max_position_size {
            return Err(Error::RiskRejected(format!(
                "position size {} exceeds limit {}",
                projected, limits.max_position_size
            )));
        }

        // 2. Order rate over a trailing 60-second window.
        if !self.record_order_stamp(&order.user_id, limits.max_orders_per_minute) {
            return Err(Error::RiskRejected(format!(
                "order frequency exceeds limit of {} per minute",
                limits.max_orders_per_minute
            )));
        }

        let metrics = self.compute_metrics(&order.user_id);

        // 3. Daily loss.
        if metrics.daily_pnl < -limits.max_daily_loss {
            return Err(Error::RiskRejected(format!(
                "daily loss {} exceeds limit {}",
                metrics.daily_pnl.abs(),
                limits.max_daily_loss
            )));
        }

        // 4. Drawdown from the day-start portfolio value.
        if metrics.drawdown > limits.max_drawdown {
            return Err(Error::RiskRejected(format!(
                "drawdown {} exceeds limit {}",
                metrics.drawdown, limits.max_drawdown
            )));
        }

        // 5. Projected single-symbol concentration.
        if metrics.portfolio_value > Decimal::ZERO {
            let price = self.estimate_price(order);
            let concentration = projected * price / metrics.portfolio_value;
            if concentration > limits.max_concentration {
                return Err(Error::RiskRejected(format!(
                    "concentration {} exceeds limit {}",
                    concentration, limits.max_concentration
                )));
            }
        }

        Ok(())
    }

    /// Periodic sweep over a user's open positions: emits a market
    /// stop-loss action when the unrealized loss breaches the limit, and a
    /// timeout notification (no forced action) for positions older than
    /// the configured age.
    pub fn monitor_positions(&self, user_id: &str) -> Vec<RiskAction> {
        let limits = self.limits_for(user_id);
        let mut actions = Vec::new();

        for position in self.ledger.positions_for_user(user_id, true) {
            if position.market_price > Decimal::ZERO && position.avg_price > Decimal::ZERO {
                let loss_pct =
                    (position.avg_price - position.market_price) / position.avg_price;
                let long_stopped =
                    position.quantity > Decimal::ZERO && loss_pct > limits.stop_loss_percentage;
                let short_stopped = position.quantity < Decimal::ZERO
                    && loss_pct < -limits.stop_loss_percentage;
                if long_stopped || short_stopped {
                    warn!(
                        user_id,
                        symbol = %position.symbol,
                        %loss_pct,
                        "stop loss triggered"
                    );
                    let side = if position.quantity > Decimal::ZERO {
                        Side::Sell
                    } else {
                        Side::Buy
                    };
                    let mut order = Order::market(
                        user_id,
                        position.symbol.clone(),
                        side,
                        position.quantity.abs(),
                    );
                    order.strategy_id = "RISK_STOP_LOSS".to_string();
                    order
                        .metadata
                        .insert("reason".into(), "stop_loss_triggered".into());
                    self.bus.publish(EngineEvent::Risk {
                        kind: RiskEventKind::StopLossTriggered,
                        position: position.clone(),
                    });
                    actions.push(RiskAction::StopLoss { order });
                }
            }

            let age = Utc::now() - position.created_at;
            if age > chrono::Duration::hours(limits.position_timeout_hours) {
                self.bus.publish(EngineEvent::Risk {
                    kind: RiskEventKind::PositionTimeout,
                    position: position.clone(),
                });
                actions.push(RiskAction::Timeout { position });
            }
        }

        actions
    }

    /// Recompute the user's risk metrics and retain the snapshot.
    pub fn compute_metrics(&self, user_id: &str) -> RiskMetrics {
        let positions = self.ledger.positions_for_user(user_id, false);
        let pnl = self.ledger.total_pnl(user_id);

        let exposures: Vec<Decimal> = positions
            .iter()
            .filter(|p| p.market_price > Decimal::ZERO)
            .map(|p| (p.quantity * p.market_price).abs())
            .collect();
        let total_exposure: Decimal = exposures.iter().copied().sum();
        let portfolio_value = if total_exposure > Decimal::ZERO {
            total_exposure
        } else {
            DEFAULT_PORTFOLIO_VALUE
        };

        let daily_pnl = pnl.total();

        let start_value = {
            let mut day_start = self.day_start.lock();
            let today = Utc::now().date_naive();
            let entry = day_start.entry(user_id.to_string()).or_insert((today, portfolio_value));
            // Recaptured on the first check of each new day.
            if entry.0 != today {
                *entry = (today, portfolio_value);
            }
            entry.1
        };
        let drawdown = if start_value > Decimal::ZERO {
            ((start_value - portfolio_value) / start_value).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let leverage_ratio = if portfolio_value > Decimal::ZERO {
            total_exposure / portfolio_value
        } else {
            Decimal::ZERO
        };

        let largest_position_pct = exposures
            .iter()
            .copied()
            .max()
            .map(|largest| largest / portfolio_value)
            .unwrap_or(Decimal::ZERO);

        let orders_last_minute = self.recent_order_count(user_id);
        let risk_level = RiskLevel::classify(drawdown, daily_pnl, leverage_ratio);

        let metrics = RiskMetrics {
            drawdown,
            daily_pnl,
            portfolio_value,
            leverage_ratio,
            largest_position_pct,
            orders_last_minute,
            risk_level,
        };
        self.metrics
            .write()
            .insert(user_id.to_string(), metrics.clone());
        metrics
    }

    /// Latest retained snapshot, if any.
    pub fn metrics_for(&self, user_id: &str) -> Option<RiskMetrics> {
        self.metrics.read().get(user_id).cloned()
    }

    /// Prune the sliding window and record the candidate order's stamp.
    /// Returns false when the window is already at the limit.
    fn record_order_stamp(&self, user_id: &str, max_per_minute: usize) -> bool {
        let mut stamps = self.order_stamps.lock();
        let window = stamps.entry(user_id.to_string()).or_default();
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        window.retain(|ts| *ts > cutoff);
        if window.len() >= max_per_minute {
            return false;
        }
        window.push(Utc::now());
        true
    }

    fn recent_order_count(&self, user_id: &str) -> usize {
        let stamps = self.order_stamps.lock();
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        stamps
            .get(user_id)
            .map(|w| w.iter().filter(|ts| **ts > cutoff).count())
            .unwrap_or(0)
    }

    fn estimate_price(&self, order: &Order) -> Decimal {
        if let Some(price) = order.price
            && price > Decimal::ZERO
        {
            return price;
        }
        if let Some(position) = self.ledger.position(&order.user_id, &order.symbol)
            && position.market_price > Decimal::ZERO
        {
            return position.market_price;
        }
        FALLBACK_PRICE
    }
}
