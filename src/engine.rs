//! Execution engine - the orchestrator. A bounded work queue feeds a fixed
//! worker pool; each worker resolves a per-user broker adapter, submits the
//! order, and attaches a status poller that runs until the order is
//! terminal. Two supervisory loops (risk sweep, stale-order sweep) keep
//! positions and in-flight orders from drifting.

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, BrokerFactory};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ledger::PositionLedger;
use crate::orderbook::{Fill, OrderBook};
use crate::risk::{RiskAction, RiskEngine};
use crate::types::{Order, OrderStatus};

/// Strategy tag carried by forced stop-loss closes; used to avoid
/// stacking a second close on a symbol that already has one in flight.
pub const RISK_STOP_LOSS: &str = "RISK_STOP_LOSS";

pub struct ExecutionEngine {
    book: Arc<OrderBook>,
    ledger: Arc<PositionLedger>,
    risk: Arc<RiskEngine>,
    factory: Arc<dyn BrokerFactory>,
    config: EngineConfig,
    queue_tx: flume::Sender<String>,
    queue_rx: flume::Receiver<String>,
    // tokio mutex: held across the factory's async resolution so two
    // workers cannot build the same user's adapter twice.
    adapters: tokio::sync::Mutex<HashMap<String, Arc<dyn BrokerAdapter>>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn new(
        book: Arc<OrderBook>,
        ledger: Arc<PositionLedger>,
        risk: Arc<RiskEngine>,
        factory: Arc<dyn BrokerFactory>,
        config: EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(config.queue_capacity);
        Self {
            book,
            ledger,
            risk,
            factory,
            config,
            queue_tx,
            queue_rx,
            adapters: tokio::sync::Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Launch the worker pool and both supervisory sweeps. Idempotent.
    pub fn start(self: &Arc<Self>, worker_count: usize) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("execution engine already running");
            return;
        }
        info!(worker_count, "starting execution engine");

        let mut handles = Vec::with_capacity(worker_count + 2);
        for worker_id in 0..worker_count {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id).await;
            }));
        }

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            engine.risk_sweep_loop().await;
        }));
        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            engine.stale_sweep_loop().await;
        }));

        self.workers.lock().extend(handles);
    }

    /// Flip the running flag and tear down workers, sweeps, and pollers.
    /// Best-effort: in-flight broker calls are abandoned and reconciled by
    /// the stale sweep on a later start.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping execution engine");

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let pollers: Vec<JoinHandle<()>> = self
            .pollers
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles.into_iter().chain(pollers) {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate, record, and enqueue an order. Blocks when the queue is
    /// full rather than dropping. The order is recorded even when risk
    /// rejects it, so the rejection is auditable.
    pub async fn submit(&self, order: Order) -> Result<String> {
        let order_id = self.book.create(order.clone())?;

        if let Err(err) = self.risk.validate(&order) {
            warn!(order_id, %err, "order rejected by risk");
            self.book
                .update_status(&order_id, OrderStatus::Rejected, None, None);
            return Err(err);
        }

        self.enqueue(order_id.clone()).await?;
        Ok(order_id)
    }

    /// Best-effort cancel: try the broker first when a broker id is known
    /// (failure logged, non-fatal), then cancel locally regardless.
    pub async fn cancel(&self, order_id: &str) -> bool {
        if let Some(order) = self.book.get(order_id)
            && let Some(broker_order_id) = order.broker_order_id.as_deref()
        {
            match self.adapter_for(&order.user_id).await {
                Ok(adapter) => {
                    if let Err(err) = adapter.cancel_order(broker_order_id).await {
                        warn!(order_id, %err, "broker cancel failed");
                    }
                }
                Err(err) => warn!(order_id, %err, "no adapter for cancel"),
            }
        }
        self.book.cancel(order_id)
    }

    async fn enqueue(&self, order_id: String) -> Result<()> {
        self.queue_tx
            .send_async(order_id)
            .await
            .map_err(|_| Error::InvalidState("execution queue closed".to_string()))
    }

    /// Lookup-or-create a user's broker adapter. First resolver wins.
    async fn adapter_for(&self, user_id: &str) -> Result<Arc<dyn BrokerAdapter>> {
        let mut adapters = self.adapters.lock().await;
        if let Some(adapter) = adapters.get(user_id) {
            return Ok(adapter.clone());
        }
        let adapter = self.factory.adapter_for(user_id).await?;
        adapters.insert(user_id.to_string(), adapter.clone());
        Ok(adapter)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(500), self.queue_rx.recv_async())
                .await
            {
                Ok(Ok(order_id)) => self.process_order(&order_id).await,
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        debug!(worker_id, "worker stopped");
    }

    async fn process_order(self: &Arc<Self>, order_id: &str) {
        let Some(order) = self.book.get(order_id) else {
            warn!(order_id, "dequeued unknown order");
            return;
        };
        // Cancelled while queued.
        if order.status != OrderStatus::Pending {
            debug!(order_id, status = %order.status, "skipping non-pending order");
            return;
        }

        let adapter = match self.adapter_for(&order.user_id).await {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(order_id, user_id = %order.user_id, %err, "adapter resolution failed");
                self.book
                    .update_status(order_id, OrderStatus::Rejected, None, None);
                return;
            }
        };

        self.book
            .update_status(order_id, OrderStatus::Submitted, None, None);

        match adapter.place_order(&order).await {
            // Placement only means the broker accepted the order. Fills and
            // terminal states always arrive through the status poller, so a
            // broker reporting FILLED at placement cannot skip the ledger.
            Ok(placement) => match placement.broker_order_id.as_deref() {
                Some(broker_order_id) => {
                    self.book.update_status(
                        order_id,
                        OrderStatus::Submitted,
                        Some(broker_order_id),
                        None,
                    );
                    self.spawn_poller(order_id.to_string());
                }
                None => {
                    warn!(order_id, broker_status = %placement.status, "broker returned no order id");
                    self.book
                        .update_status(order_id, OrderStatus::Rejected, None, None);
                }
            },
            Err(err) => {
                error!(order_id, %err, "broker placement failed");
                self.book
                    .update_status(order_id, OrderStatus::Rejected, None, None);
            }
        }
    }

    /// Attach a status poller to an in-flight order. No-op when one is
    /// already attached. The poller maps broker status vocabulary to the
    /// internal enum, turns cumulative fill quantities into deltas, and
    /// stops on any terminal status.
    fn spawn_poller(self: &Arc<Self>, order_id: String) {
        let mut pollers = self.pollers.lock();
        if pollers.contains_key(&order_id) {
            return;
        }
        let engine = self.clone();
        let id = order_id.clone();
        let handle = tokio::spawn(async move {
            engine.poll_order(&id).await;
            engine.pollers.lock().remove(&id);
        });
        pollers.insert(order_id, handle);
    }

    async fn poll_order(self: &Arc<Self>, order_id: &str) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;

            let Some(order) = self.book.get(order_id) else {
                return;
            };
            if order.status.is_terminal() {
                return;
            }
            let Some(broker_order_id) = order.broker_order_id.clone() else {
                continue;
            };
            let adapter = match self.adapter_for(&order.user_id).await {
                Ok(adapter) => adapter,
                Err(err) => {
                    warn!(order_id, %err, "poller lost adapter");
                    return;
                }
            };

            let update = match adapter.order_status(&broker_order_id).await {
                Ok(Some(update)) => update,
                Ok(None) => {
                    warn!(order_id, broker_order_id, "broker does not know order");
                    continue;
                }
                Err(err) => {
                    warn!(order_id, %err, "status poll failed");
                    continue;
                }
            };

            let status = OrderStatus::from_broker(&update.status);
            // Broker reports cumulative fills; apply only the delta, capped
            // at the unfilled remainder.
            let remaining = order.quantity - order.filled_quantity;
            let delta = (update.filled_quantity - order.filled_quantity).min(remaining);
            let fill = (delta > Decimal::ZERO).then(|| Fill {
                quantity: delta,
                price: update.fill_price,
            });

            // The ledger only sees fills the book accepted. A rejected
            // transition leaves filled_quantity unchanged, so forwarding
            // the delta anyway would re-apply it on every poll.
            if !self.book.update_status(order_id, status, None, fill) {
                if self.book.get(order_id).is_none_or(|o| o.status.is_terminal()) {
                    debug!(order_id, "order reached a terminal state elsewhere");
                    return;
                }
                warn!(order_id, broker_status = %update.status, "book rejected poll update");
                continue;
            }
            if delta > Decimal::ZERO {
                self.ledger.apply_fill(
                    &order.user_id,
                    &order.symbol,
                    delta,
                    update.fill_price,
                    order.side,
                );
            }
            if status.is_terminal() {
                debug!(order_id, status = %status, "poller finished");
                return;
            }
        }
    }

    /// Every `risk_sweep_secs`: run the risk monitor for each user with
    /// open positions and enqueue any forced closes. Stop-loss orders skip
    /// validation (they reduce risk) but still flow through the book and
    /// the queue like any other order.
    async fn risk_sweep_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.risk_sweep_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            for user_id in self.ledger.users_with_open_positions() {
                for action in self.risk.monitor_positions(&user_id) {
                    match action {
                        RiskAction::StopLoss { order } => {
                            if self.has_active_stop_loss(&user_id, &order.symbol) {
                                debug!(user_id, symbol = %order.symbol, "stop loss already in flight");
                                continue;
                            }
                            let symbol = order.symbol.clone();
                            match self.book.create(order) {
                                Ok(order_id) => {
                                    warn!(user_id, %symbol, order_id, "submitting forced close");
                                    if let Err(err) = self.enqueue(order_id).await {
                                        error!(%err, "failed to enqueue forced close");
                                    }
                                }
                                Err(err) => error!(%err, "failed to record forced close"),
                            }
                        }
                        RiskAction::Timeout { position } => {
                            info!(
                                user_id,
                                symbol = %position.symbol,
                                "position exceeded holding timeout"
                            );
                        }
                    }
                }
            }
        }
    }

    fn has_active_stop_loss(&self, user_id: &str, symbol: &str) -> bool {
        self.book
            .orders_for_symbol(symbol, true)
            .iter()
            .any(|o| o.user_id == user_id && o.strategy_id == RISK_STOP_LOSS)
    }

    /// Every `stale_sweep_secs`: re-attach a poller to any SUBMITTED order
    /// with a broker id that has gone unpolled longer than the stale
    /// threshold (poller lost to a crash or a restart).
    async fn stale_sweep_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.stale_sweep_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_after_secs);
            for order in self.book.with_status(OrderStatus::Submitted) {
                if order.broker_order_id.is_some()
                    && order.updated_at < cutoff
                    && !self.pollers.lock().contains_key(&order.id)
                {
                    warn!(order_id = %order.id, "re-attaching poller to stale order");
                    self.spawn_poller(order.id.clone());
                }
            }
        }
    }
}
