//! Market data feeds - one long-lived websocket per source, subscription
//! deltas, exponential backoff reconnection, and synchronous tick fan-out
//! with per-callback error isolation.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::types::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: reconnect attempts exhausted, operator intervention
    /// required.
    Error,
}

/// Backoff schedule for reconnect attempt `n` (1-based):
/// base * 2^(n-1), capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(cap)
}

pub type TickCallback = Arc<dyn Fn(&Tick) -> Result<()> + Send + Sync>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire tick. Sources differ on the price field name; `ltp` (last traded
/// price) is accepted as an alias.
#[derive(Debug, Deserialize)]
struct WireTick {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    symbol: String,
    #[serde(alias = "ltp")]
    price: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    bid: Option<Decimal>,
    #[serde(default)]
    ask: Option<Decimal>,
    #[serde(default)]
    open: Option<Decimal>,
    #[serde(default)]
    high: Option<Decimal>,
    #[serde(default)]
    low: Option<Decimal>,
    #[serde(default)]
    close: Option<Decimal>,
}

pub struct MarketDataFeed {
    name: String,
    url: String,
    auth_headers: Vec<(String, String)>,
    status: RwLock<FeedStatus>,
    subscriptions: RwLock<HashSet<String>>,
    callbacks: RwLock<Vec<TickCallback>>,
    // Upstream control messages queued for the run loop while connected.
    control_tx: flume::Sender<String>,
    control_rx: flume::Receiver<String>,
    running: AtomicBool,
    // Flipped to true by stop(); select arms watch it for prompt exit.
    shutdown: watch::Sender<bool>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl MarketDataFeed {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let (control_tx, control_rx) = flume::unbounded();
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            url: url.into(),
            auth_headers: Vec::new(),
            status: RwLock::new(FeedStatus::Disconnected),
            subscriptions: RwLock::new(HashSet::new()),
            callbacks: RwLock::new(Vec::new()),
            control_tx,
            control_rx,
            running: AtomicBool::new(false),
            shutdown,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    pub fn with_auth_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_headers.push((key.into(), value.into()));
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration, max_attempts: u32) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self.max_attempts = max_attempts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> FeedStatus {
        *self.status.read()
    }

    pub fn on_tick(&self, callback: TickCallback) {
        self.callbacks.write().push(callback);
    }

    /// Add symbols to the subscription set. Only the delta is sent
    /// upstream; while disconnected this is a no-op applied lazily on the
    /// next connect.
    pub fn subscribe(&self, symbols: &[String]) {
        let delta = {
            let mut subs = self.subscriptions.write();
            symbols
                .iter()
                .filter(|s| subs.insert((*s).clone()))
                .cloned()
                .collect::<Vec<_>>()
        };
        if !delta.is_empty() && self.status() == FeedStatus::Connected {
            self.send_control("subscribe", &delta);
        }
    }

    pub fn unsubscribe(&self, symbols: &[String]) {
        let delta = {
            let mut subs = self.subscriptions.write();
            symbols
                .iter()
                .filter(|s| subs.remove(*s))
                .cloned()
                .collect::<Vec<_>>()
        };
        if !delta.is_empty() && self.status() == FeedStatus::Connected {
            self.send_control("unsubscribe", &delta);
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    fn send_control(&self, action: &str, symbols: &[String]) {
        let msg = json!({ "action": action, "symbols": symbols }).to_string();
        // Unbounded and never closed while the feed is alive.
        let _ = self.control_tx.send(msg);
    }

    /// The feed's run loop: connect, read until the connection drops, then
    /// reconnect with exponential backoff. Returns only when stopped or
    /// when reconnect attempts are exhausted.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(false);
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            *self.status.write() = if attempt == 0 {
                FeedStatus::Connecting
            } else {
                FeedStatus::Reconnecting
            };

            let session = match self.connect().await {
                Ok(stream) => {
                    // Connection established: the attempt budget is
                    // per-outage, not per-lifetime.
                    attempt = 0;
                    self.listen(stream, &mut shutdown).await
                }
                Err(err) => Err(err),
            };

            match session {
                Ok(()) => break,
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_attempts {
                        error!(feed = %self.name, %err, "reconnect attempts exhausted");
                        *self.status.write() = FeedStatus::Error;
                        return Err(Error::Feed(format!(
                            "feed {} gave up after {} attempts",
                            self.name, self.max_attempts
                        )));
                    }
                    let delay = backoff_delay(attempt, self.base_delay, self.max_delay);
                    warn!(feed = %self.name, attempt, ?delay, %err, "feed disconnected, backing off");
                    *self.status.write() = FeedStatus::Reconnecting;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stopped| *stopped) => break,
                    }
                }
            }
        }

        *self.status.write() = FeedStatus::Disconnected;
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::Feed(format!("bad feed url {}: {e}", self.url)))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Feed(format!("bad feed url {}: {e}", self.url)))?;
        for (key, value) in &self.auth_headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = key
                .parse()
                .map_err(|_| Error::Feed(format!("bad auth header name {key}")))?;
            let value = value
                .parse()
                .map_err(|_| Error::Feed(format!("bad auth header value for {key}")))?;
            request.headers_mut().insert(name, value);
        }

        info!(feed = %self.name, url = %self.url, "connecting");
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::Feed(e.to_string()))?;
        Ok(stream)
    }

    async fn listen(&self, stream: WsStream, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let (mut write, mut read) = stream.split();

        *self.status.write() = FeedStatus::Connected;
        info!(feed = %self.name, "connected");

        // Drop control messages queued while disconnected; the full set is
        // resubscribed here instead.
        while self.control_rx.try_recv().is_ok() {}
        let symbols = self.subscriptions();
        if !symbols.is_empty() {
            let msg = json!({ "action": "subscribe", "symbols": symbols }).to_string();
            write
                .send(Message::Text(msg))
                .await
                .map_err(|e| Error::Feed(e.to_string()))?;
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(tick) = parse_tick(&text) {
                                self.fan_out(&tick);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| Error::Feed(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(feed = %self.name, "server closed connection");
                            return Err(Error::Feed("connection closed".to_string()));
                        }
                        Some(Err(e)) => return Err(Error::Feed(e.to_string())),
                        None => return Err(Error::Feed("stream ended".to_string())),
                        _ => {}
                    }
                }
                control = self.control_rx.recv_async() => {
                    match control {
                        Ok(msg) => {
                            write
                                .send(Message::Text(msg))
                                .await
                                .map_err(|e| Error::Feed(e.to_string()))?;
                        }
                        Err(_) => return Ok(()),
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {
                    info!(feed = %self.name, "feed stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Synchronous fan-out. A failing callback is logged and never stops
    /// delivery to the rest.
    fn fan_out(&self, tick: &Tick) {
        for callback in self.callbacks.read().iter() {
            if let Err(err) = callback(tick) {
                warn!(feed = %self.name, symbol = %tick.symbol, %err, "tick callback failed");
            }
        }
    }
}

fn parse_tick(text: &str) -> Option<Tick> {
    let wire: WireTick = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(err) => {
            debug!(%err, "ignoring non-tick message");
            return None;
        }
    };
    if let Some(kind) = &wire.kind
        && kind != "tick"
    {
        return None;
    }
    Some(Tick {
        symbol: wire.symbol,
        price: wire.price,
        volume: wire.volume,
        timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        bid: wire.bid,
        ask: wire.ask,
        bid_size: None,
        ask_size: None,
        open: wire.open,
        high: wire.high,
        low: wire.low,
        close: wire.close,
    })
}

/// Multiplexes several named feeds and keeps a global callback list that
/// is attached to every feed, current and future.
pub struct FeedManager {
    feeds: RwLock<HashMap<String, Arc<MarketDataFeed>>>,
    // symbol -> feed name, for unsubscribing without naming the feed
    symbol_feeds: RwLock<HashMap<String, String>>,
    callbacks: RwLock<Vec<TickCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedManager {
    pub fn new() -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            symbol_feeds: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a feed and spawn its run loop.
    pub fn add_feed(&self, feed: Arc<MarketDataFeed>) {
        for callback in self.callbacks.read().iter() {
            feed.on_tick(callback.clone());
        }
        self.feeds
            .write()
            .insert(feed.name().to_string(), feed.clone());

        let handle = tokio::spawn(async move {
            if let Err(err) = feed.run().await {
                error!(feed = %feed.name(), %err, "feed terminated");
            }
        });
        self.tasks.lock().push(handle);
    }

    pub fn feed(&self, name: &str) -> Option<Arc<MarketDataFeed>> {
        self.feeds.read().get(name).cloned()
    }

    /// Attach a callback to every registered feed, and remember it for
    /// feeds added later.
    pub fn on_tick(&self, callback: TickCallback) {
        for feed in self.feeds.read().values() {
            feed.on_tick(callback.clone());
        }
        self.callbacks.write().push(callback);
    }

    /// Route a symbol to a named feed and subscribe it there.
    pub fn subscribe_symbol(&self, symbol: &str, feed_name: &str) -> Result<()> {
        let feed = self
            .feed(feed_name)
            .ok_or_else(|| Error::NotFound(format!("feed {feed_name}")))?;
        feed.subscribe(std::slice::from_ref(&symbol.to_string()));
        self.symbol_feeds
            .write()
            .insert(symbol.to_string(), feed_name.to_string());
        Ok(())
    }

    /// Unsubscribe a symbol from whichever feed carries it.
    pub fn unsubscribe_symbol(&self, symbol: &str) -> Result<()> {
        let feed_name = self
            .symbol_feeds
            .write()
            .remove(symbol)
            .ok_or_else(|| Error::NotFound(format!("symbol {symbol} is not subscribed")))?;
        if let Some(feed) = self.feed(&feed_name) {
            feed.unsubscribe(std::slice::from_ref(&symbol.to_string()));
        }
        Ok(())
    }

    pub fn stop_feed(&self, name: &str) -> Result<()> {
        let feed = self
            .feed(name)
            .ok_or_else(|| Error::NotFound(format!("feed {name}")))?;
        feed.stop();
        Ok(())
    }

    pub async fn stop_all(&self) {
        for feed in self.feeds.read().values() {
            feed.stop();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Default for FeedManager {
    fn default() -> Self {
        Self::new()
    }
}
