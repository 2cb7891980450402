use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

use tradepulse::broker::{BrokerCredentials, PaperBroker, PaperBrokerFactory, StaticCredentials};
use tradepulse::engine::ExecutionEngine;
use tradepulse::events::{EngineEvent, EventBus};
use tradepulse::feed::{FeedManager, MarketDataFeed};
use tradepulse::ledger::PositionLedger;
use tradepulse::orderbook::OrderBook;
use tradepulse::risk::RiskEngine;
use tradepulse::types::{Order, Side};
use tradepulse::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tradepulse=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    tracing::info!("TradePulse starting (paper mode)");

    let bus = Arc::new(EventBus::new());
    let book = Arc::new(OrderBook::new(bus.clone()));
    let ledger = Arc::new(PositionLedger::new(bus.clone()));
    let risk = Arc::new(RiskEngine::new(ledger.clone(), bus.clone()));

    let broker = Arc::new(PaperBroker::new());
    broker.set_quote("ACME", Decimal::from(150));
    let credentials = Arc::new(StaticCredentials::new());
    credentials.insert(
        "demo",
        BrokerCredentials {
            api_key: "paper".to_string(),
            api_secret: "paper".to_string(),
        },
    );
    let factory = Arc::new(PaperBrokerFactory::new(broker.clone(), credentials));

    let engine = Arc::new(ExecutionEngine::new(
        book.clone(),
        ledger.clone(),
        risk.clone(),
        factory,
        config.engine.clone(),
    ));
    engine.start(config.engine.workers);

    // Log everything the engine publishes.
    let events = bus.subscribe(256);
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                EngineEvent::Order { kind, order } => {
                    tracing::info!(?kind, order_id = %order.id, status = %order.status, "order event");
                }
                EngineEvent::Position { kind, position } => {
                    tracing::debug!(?kind, symbol = %position.symbol, qty = %position.quantity, "position event");
                }
                EngineEvent::Risk { kind, position } => {
                    tracing::warn!(?kind, symbol = %position.symbol, "risk event");
                }
            }
        }
    });

    // Wire configured feeds into the ledger's mark-to-market path.
    let feeds = Arc::new(FeedManager::new());
    let mark_ledger = ledger.clone();
    feeds.on_tick(Arc::new(move |tick| {
        mark_ledger.mark_price(&tick.symbol, tick.price);
        Ok(())
    }));
    for feed_config in &config.feeds {
        let mut feed = MarketDataFeed::new(&feed_config.name, &feed_config.url).with_backoff(
            Duration::from_secs(feed_config.reconnect_base_secs),
            Duration::from_secs(feed_config.reconnect_max_secs),
            feed_config.max_reconnect_attempts,
        );
        for (key, value) in &feed_config.auth_headers {
            feed = feed.with_auth_header(key, value);
        }
        let feed = Arc::new(feed);
        feed.subscribe(&feed_config.symbols);
        feeds.add_feed(feed);
    }

    let order_id = engine
        .submit(Order::market("demo", "ACME", Side::Buy, Decimal::from(10)))
        .await?;
    tracing::info!(order_id, "submitted demo order");

    tokio::time::sleep(Duration::from_secs(3)).await;

    if let Some(position) = ledger.position("demo", "ACME") {
        tracing::info!(
            qty = %position.quantity,
            avg = %position.avg_price,
            "demo position after fill"
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    feeds.stop_all().await;
    engine.stop().await;
    Ok(())
}
