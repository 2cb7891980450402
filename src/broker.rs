//! Broker adapter capability surface - wire-independent result types, the
//! credential/factory traits used to resolve a per-user adapter, and a
//! paper broker for tests and the demo binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Order, Position, Side};

/// Result of placing an order at the broker. `status` carries the broker's
/// own vocabulary; callers map it through `OrderStatus::from_broker`.
#[derive(Debug, Clone)]
pub struct BrokerPlacement {
    pub status: String,
    pub broker_order_id: Option<String>,
    pub message: Option<String>,
}

/// Snapshot returned by a status poll. Filled quantity is CUMULATIVE
/// since placement; pollers turn it into a delta.
#[derive(Debug, Clone)]
pub struct BrokerOrderUpdate {
    pub status: String,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub fill_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, order: &Order) -> Result<BrokerPlacement>;

    /// Best-effort cancel. `false` means the broker refused (already
    /// terminal), not a transport failure.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool>;

    /// `None` when the broker no longer knows the order.
    async fn order_status(&self, broker_order_id: &str) -> Result<Option<BrokerOrderUpdate>>;

    async fn positions(&self) -> Result<Vec<Position>>;
}

/// Secret material sufficient to construct a broker adapter for a user.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Absence is a hard failure: the order is rejected, not retried.
    async fn credentials(&self, user_id: &str) -> Result<BrokerCredentials>;
}

/// In-memory credential store for tests and paper trading.
#[derive(Default)]
pub struct StaticCredentials {
    entries: Mutex<HashMap<String, BrokerCredentials>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: impl Into<String>, credentials: BrokerCredentials) {
        self.entries.lock().insert(user_id.into(), credentials);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self, user_id: &str) -> Result<BrokerCredentials> {
        self.entries
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no broker credentials for user {user_id}")))
    }
}

#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn adapter_for(&self, user_id: &str) -> Result<Arc<dyn BrokerAdapter>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl PaperStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PaperStatus::New => "NEW",
            PaperStatus::PartiallyFilled => "PARTIALLY_FILLED",
            PaperStatus::Filled => "FILLED",
            PaperStatus::Cancelled => "CANCELLED",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, PaperStatus::Filled | PaperStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    #[allow(dead_code)]
    side: Side,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    filled: Decimal,
    fill_price: Decimal,
    status: PaperStatus,
}

/// Simulated broker. With `auto_fill` on (the default), every placed order
/// reports FILLED on its next status poll at the quoted price, the order's
/// limit price, or 100 as a last resort.
pub struct PaperBroker {
    quotes: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<String, PaperOrder>>,
    next_id: AtomicU64,
    auto_fill: bool,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            quotes: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            auto_fill: true,
        }
    }

    pub fn manual() -> Self {
        Self {
            auto_fill: false,
            ..Self::new()
        }
    }

    pub fn set_quote(&self, symbol: impl Into<String>, price: Decimal) {
        self.quotes.lock().insert(symbol.into(), price);
    }

    /// Apply a manual (partial) fill, for driving poller scenarios in
    /// tests. Quantities accumulate; the recorded fill price is the
    /// running average the next status poll will report.
    pub fn fill(&self, broker_order_id: &str, quantity: Decimal, price: Decimal) -> Result<()> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(broker_order_id)
            .ok_or_else(|| Error::NotFound(format!("paper order {broker_order_id}")))?;
        if order.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "paper order {broker_order_id} is {}",
                order.status.as_str()
            )));
        }
        let new_filled = (order.filled + quantity).min(order.quantity);
        let delta = new_filled - order.filled;
        if delta > Decimal::ZERO {
            order.fill_price =
                (order.fill_price * order.filled + price * delta) / new_filled;
            order.filled = new_filled;
        }
        order.status = if order.filled >= order.quantity {
            PaperStatus::Filled
        } else {
            PaperStatus::PartiallyFilled
        };
        Ok(())
    }

    fn quote_or_fallback(&self, symbol: &str, limit: Option<Decimal>) -> Decimal {
        if let Some(price) = self.quotes.lock().get(symbol) {
            return *price;
        }
        limit.unwrap_or(Decimal::from(100))
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_order(&self, order: &Order) -> Result<BrokerPlacement> {
        let id = format!("PB-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(broker_order_id = %id, symbol = %order.symbol, "paper order placed");
        self.orders.lock().insert(
            id.clone(),
            PaperOrder {
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.quantity,
                limit_price: order.price,
                filled: Decimal::ZERO,
                fill_price: Decimal::ZERO,
                status: PaperStatus::New,
            },
        );
        Ok(BrokerPlacement {
            status: "NEW".to_string(),
            broker_order_id: Some(id),
            message: None,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let mut orders = self.orders.lock();
        match orders.get_mut(broker_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = PaperStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn order_status(&self, broker_order_id: &str) -> Result<Option<BrokerOrderUpdate>> {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(broker_order_id) else {
            return Ok(None);
        };
        if self.auto_fill && order.status == PaperStatus::New {
            let symbol = order.symbol.clone();
            order.fill_price = self.quote_or_fallback(&symbol, order.limit_price);
            order.filled = order.quantity;
            order.status = PaperStatus::Filled;
        }
        Ok(Some(BrokerOrderUpdate {
            status: order.status.as_str().to_string(),
            filled_quantity: order.filled,
            remaining_quantity: order.quantity - order.filled,
            fill_price: order.fill_price,
            timestamp: Utc::now(),
        }))
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        Ok(Vec::new())
    }
}

/// Returns the same shared paper adapter for every user whose credentials
/// resolve; missing credentials fail resolution, which rejects the order.
pub struct PaperBrokerFactory {
    broker: Arc<PaperBroker>,
    credentials: Arc<dyn CredentialProvider>,
}

impl PaperBrokerFactory {
    pub fn new(broker: Arc<PaperBroker>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            broker,
            credentials,
        }
    }
}

#[async_trait]
impl BrokerFactory for PaperBrokerFactory {
    async fn adapter_for(&self, user_id: &str) -> Result<Arc<dyn BrokerAdapter>> {
        self.credentials.credentials(user_id).await?;
        Ok(self.broker.clone())
    }
}
