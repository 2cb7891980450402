//! End-to-end pipeline tests against the public API: tick -> strategy ->
//! submit -> paper broker fill -> ledger -> risk sweep.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use tradepulse::broker::{BrokerCredentials, PaperBroker, PaperBrokerFactory, StaticCredentials};
use tradepulse::engine::ExecutionEngine;
use tradepulse::events::{EngineEvent, EventBus, OrderEventKind};
use tradepulse::ledger::PositionLedger;
use tradepulse::orderbook::OrderBook;
use tradepulse::risk::RiskEngine;
use tradepulse::strategy::{Strategy, ThresholdStrategy};
use tradepulse::types::{Order, OrderStatus, Side, SignalDirection, Tick};
use tradepulse::EngineConfig;

struct Harness {
    bus: Arc<EventBus>,
    book: Arc<OrderBook>,
    ledger: Arc<PositionLedger>,
    broker: Arc<PaperBroker>,
    engine: Arc<ExecutionEngine>,
}

fn harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let book = Arc::new(OrderBook::new(bus.clone()));
    let ledger = Arc::new(PositionLedger::new(bus.clone()));
    let risk = Arc::new(RiskEngine::new(ledger.clone(), bus.clone()));

    let broker = Arc::new(PaperBroker::new());
    let credentials = Arc::new(StaticCredentials::new());
    credentials.insert(
        "u1",
        BrokerCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
        },
    );
    let factory = Arc::new(PaperBrokerFactory::new(broker.clone(), credentials));

    let config = EngineConfig {
        poll_interval_ms: 20,
        risk_sweep_secs: 1,
        ..Default::default()
    };
    let engine = Arc::new(ExecutionEngine::new(
        book.clone(),
        ledger.clone(),
        risk,
        factory,
        config,
    ));
    Harness {
        bus,
        book,
        ledger,
        broker,
        engine,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn tick_to_filled_position() {
    let h = harness();
    h.broker.set_quote("ACME", Decimal::from(95));
    h.engine.start(2);

    // A strategy turns the tick into a signal; sizing is up to us.
    let mut strategy = ThresholdStrategy::new("ACME", Decimal::from(100));
    let signal = strategy
        .process_tick(&Tick::new("ACME", Decimal::from(95)))
        .expect("signal below threshold");
    assert_eq!(signal.direction, SignalDirection::Long);

    let order = Order::limit("u1", &signal.symbol, Side::Buy, Decimal::from(10), signal.entry_price);
    let order_id = h.engine.submit(order).await.unwrap();

    wait_for("order fill", || {
        h.book.get(&order_id).map(|o| o.status) == Some(OrderStatus::Filled)
    })
    .await;

    let position = h.ledger.position("u1", "ACME").unwrap();
    assert_eq!(position.quantity, Decimal::from(10));
    assert_eq!(position.avg_price, Decimal::from(95));

    // Mark-to-market moves unrealized P&L.
    h.ledger.mark_price("ACME", Decimal::from(105));
    let position = h.ledger.position("u1", "ACME").unwrap();
    assert_eq!(position.unrealized_pnl, Decimal::from(100));

    h.engine.stop().await;
}

#[tokio::test]
async fn order_lifecycle_is_observable_on_the_bus() {
    let h = harness();
    h.broker.set_quote("ACME", Decimal::from(100));
    let events = h.bus.subscribe(256);
    h.engine.start(1);

    let order_id = h
        .engine
        .submit(Order::market("u1", "ACME", Side::Buy, Decimal::from(3)))
        .await
        .unwrap();

    wait_for("order fill", || {
        h.book.get(&order_id).map(|o| o.status) == Some(OrderStatus::Filled)
    })
    .await;
    h.engine.stop().await;

    let mut saw_created = false;
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Order { kind, order } = event
            && order.id == order_id
        {
            match kind {
                OrderEventKind::Created => saw_created = true,
                OrderEventKind::Updated => statuses.push(order.status),
            }
        }
    }
    assert!(saw_created);
    assert_eq!(statuses.first(), Some(&OrderStatus::Submitted));
    assert_eq!(statuses.last(), Some(&OrderStatus::Filled));
}

#[tokio::test]
async fn round_trip_realizes_pnl() {
    let h = harness();
    h.broker.set_quote("ACME", Decimal::from(100));
    h.engine.start(1);

    let buy = h
        .engine
        .submit(Order::market("u1", "ACME", Side::Buy, Decimal::from(5)))
        .await
        .unwrap();
    wait_for("buy fill", || {
        h.book.get(&buy).map(|o| o.status) == Some(OrderStatus::Filled)
    })
    .await;

    h.broker.set_quote("ACME", Decimal::from(110));
    let sell = h
        .engine
        .submit(Order::market("u1", "ACME", Side::Sell, Decimal::from(5)))
        .await
        .unwrap();
    wait_for("sell fill", || {
        h.book.get(&sell).map(|o| o.status) == Some(OrderStatus::Filled)
    })
    .await;

    let position = h.ledger.position("u1", "ACME").unwrap();
    assert_eq!(position.quantity, Decimal::ZERO);
    assert_eq!(position.realized_pnl, Decimal::from(50));
    assert_eq!(h.ledger.total_pnl("u1").realized, Decimal::from(50));

    h.engine.stop().await;
}
