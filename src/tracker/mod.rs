//! Order book tracker: fuses REST snapshots with a live diff/trade stream
//! into one `OrderBook` per symbol.
//!
//! The router/per-symbol-worker/ready-signal shape is `_order_book_tracker.py`
//! (`examples/original_source/hummingbot/core/data_type/order_book_tracker.py`)
//! translated task-for-task onto tokio: `_order_book_diff_router` and
//! `_track_single_book` become one spawned task per concern instead of one
//! asyncio task per coroutine method, `_saved_message_queues`/
//! `_past_diffs_windows` stay ring buffers with the same capacities, and the
//! `_order_books_initialized` asyncio.Event becomes a `tokio::sync::Notify`
//! paired with an `AtomicBool` for a synchronous `is_ready()` check.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::event_hub::{EventHub, PipelineEvent};
use crate::exchange::ExchangeAdapter;
use crate::order_book::{OrderBook, OrderBookMessage, OrderBookMessageKind};
use crate::web_assistant::RestAssistant;

struct RingQueue {
    capacity: usize,
    items: VecDeque<OrderBookMessage>,
}

impl RingQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, msg: OrderBookMessage) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(msg);
    }

    fn drain_into(&mut self) -> Vec<OrderBookMessage> {
        self.items.drain(..).collect()
    }

    fn snapshot(&self) -> Vec<OrderBookMessage> {
        self.items.iter().cloned().collect()
    }
}

struct Shared {
    order_books: RwLock<HashMap<String, Arc<OrderBook>>>,
    tracking_queues: Mutex<HashMap<String, mpsc::UnboundedSender<OrderBookMessage>>>,
    saved_queues: Mutex<HashMap<String, RingQueue>>,
    past_diffs: Mutex<HashMap<String, RingQueue>>,
    initialized: RwLock<HashSet<String>>,
    ready_flag: AtomicBool,
    ready_notify: Notify,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    rejected_diffs: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            order_books: RwLock::new(HashMap::new()),
            tracking_queues: Mutex::new(HashMap::new()),
            saved_queues: Mutex::new(HashMap::new()),
            past_diffs: Mutex::new(HashMap::new()),
            initialized: RwLock::new(HashSet::new()),
            ready_flag: AtomicBool::new(false),
            ready_notify: Notify::new(),
            tasks: Mutex::new(HashMap::new()),
            rejected_diffs: AtomicU64::new(0),
        }
    }
}

/// Fuses REST-snapshot init with live diff/trade streams for one exchange
/// instance. `A` is a single exchange plugin; one tracker exists per
/// exchange the strategy layer trades on.
pub struct OrderBookTracker<A: ExchangeAdapter + 'static> {
    exchange: Arc<A>,
    rest: Arc<RestAssistant>,
    saved_queue_capacity: usize,
    past_diffs_capacity: usize,
    outdated_trade_age: Duration,
    trade_rest_refresh_min: Duration,
    event_hub: Arc<EventHub>,
    shared: Arc<Shared>,
    trade_loop: Mutex<Option<JoinHandle<()>>>,
    rest_price_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<A: ExchangeAdapter + 'static> OrderBookTracker<A> {
    pub fn new(
        exchange: Arc<A>,
        rest: Arc<RestAssistant>,
        saved_queue_capacity: usize,
        past_diffs_capacity: usize,
        outdated_trade_age: Duration,
        trade_rest_refresh_min: Duration,
        event_hub: Arc<EventHub>,
    ) -> Self {
        Self {
            exchange,
            rest,
            saved_queue_capacity,
            past_diffs_capacity,
            outdated_trade_age,
            trade_rest_refresh_min,
            event_hub,
            shared: Arc::new(Shared::new()),
            trade_loop: Mutex::new(None),
            rest_price_loop: Mutex::new(None),
        }
    }

    pub fn order_book(&self, trading_pair: &str) -> Option<Arc<OrderBook>> {
        self.shared.order_books.read().get(trading_pair).cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready_flag.load(Ordering::Acquire)
    }

    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            self.shared.ready_notify.notified().await;
        }
    }

    pub fn rejected_diff_count(&self) -> u64 {
        self.shared.rejected_diffs.load(Ordering::Relaxed)
    }

    /// Initializes every pair via REST snapshot (sequentially, one pair at
    /// a time, to stay within REST rate limits), then spawns the diff
    /// router, snapshot router, trade loop, and stale-trade-price loop.
    /// Diffs for `trading_pairs` that arrive on `diff_rx` before a pair is
    /// initialized are buffered; diffs for a pair that has since been
    /// removed are dropped by the router, never reaching a book. The
    /// snapshot router waits for init instead of buffering, since a live
    /// snapshot arriving before every pair's initial REST snapshot has
    /// nothing useful to reconcile against yet.
    pub async fn start(
        self: &Arc<Self>,
        trading_pairs: Vec<String>,
        mut diff_rx: mpsc::UnboundedReceiver<OrderBookMessage>,
        trade_rx: mpsc::UnboundedReceiver<OrderBookMessage>,
        mut snapshot_rx: mpsc::UnboundedReceiver<OrderBookMessage>,
    ) -> PipelineResult<()> {
        {
            let mut saved = self.shared.saved_queues.lock();
            for pair in &trading_pairs {
                saved
                    .entry(pair.clone())
                    .or_insert_with(|| RingQueue::new(self.saved_queue_capacity));
            }
        }

        let router_self = self.clone();
        let router_task = tokio::spawn(async move {
            while let Some(msg) = diff_rx.recv().await {
                router_self.route_diff(msg);
            }
        });
        self.shared
            .tasks
            .lock()
            .insert("__diff_router".to_string(), router_task);

        let snapshot_router_self = self.clone();
        let snapshot_router_task = tokio::spawn(async move {
            snapshot_router_self.wait_ready().await;
            while let Some(msg) = snapshot_rx.recv().await {
                snapshot_router_self.route_snapshot(msg);
            }
        });
        self.shared
            .tasks
            .lock()
            .insert("__snapshot_router".to_string(), snapshot_router_task);

        for pair in &trading_pairs {
            self.init_one(pair).await?;
        }

        self.shared.ready_flag.store(true, Ordering::Release);
        self.shared.ready_notify.notify_waiters();
        info!(count = trading_pairs.len(), "order book tracker ready");

        let trade_self = self.clone();
        *self.trade_loop.lock() = Some(tokio::spawn(async move {
            trade_self.emit_trade_event_loop(trade_rx).await;
        }));

        let price_self = self.clone();
        *self.rest_price_loop.lock() = Some(tokio::spawn(async move {
            price_self.update_last_trade_prices_loop().await;
        }));

        Ok(())
    }

    /// Aborts every spawned task and clears all tracked state so a
    /// subsequent `start()` begins from a clean slate: `start(); stop();
    /// start()` is consistent.
    pub async fn stop(&self) {
        self.shared.ready_flag.store(false, Ordering::Release);
        for (_, task) in self.shared.tasks.lock().drain() {
            task.abort();
        }
        if let Some(task) = self.trade_loop.lock().take() {
            task.abort();
        }
        if let Some(task) = self.rest_price_loop.lock().take() {
            task.abort();
        }
        self.shared.order_books.write().clear();
        self.shared.tracking_queues.lock().clear();
        self.shared.saved_queues.lock().clear();
        self.shared.past_diffs.lock().clear();
        self.shared.initialized.write().clear();
    }

    /// Adds a pair at runtime: REST-initializes it and spawns its worker.
    /// Returns the book so the caller can resubscribe its WS channel.
    pub async fn add_trading_pair(self: &Arc<Self>, trading_pair: &str) -> PipelineResult<Arc<OrderBook>> {
        self.shared
            .saved_queues
            .lock()
            .entry(trading_pair.to_string())
            .or_insert_with(|| RingQueue::new(self.saved_queue_capacity));
        self.init_one(trading_pair).await?;
        self.order_book(trading_pair)
            .ok_or_else(|| crate::error::PipelineError::Misconfigured(format!("{trading_pair} failed to initialize")))
    }

    /// Removes a pair: aborts its worker, drops its queues/window/book.
    /// Once this returns, no further diff for `trading_pair` is routed
    /// anywhere — the router's `initialized` check simply stops matching.
    pub fn remove_trading_pair(&self, trading_pair: &str) {
        self.shared.initialized.write().remove(trading_pair);
        if let Some(task) = self.shared.tasks.lock().remove(trading_pair) {
            task.abort();
        }
        self.shared.tracking_queues.lock().remove(trading_pair);
        self.shared.saved_queues.lock().remove(trading_pair);
        self.shared.past_diffs.lock().remove(trading_pair);
        self.shared.order_books.write().remove(trading_pair);
    }

    async fn init_one(self: &Arc<Self>, trading_pair: &str) -> PipelineResult<()> {
        let url = self.exchange.order_book_snapshot_url(trading_pair);
        let limits = self.exchange.rate_limits();
        let limit_id = limits
            .first()
            .map(|l| l.id.clone())
            .unwrap_or_else(|| "default".to_string());
        let body = self.rest.get(&url, &limit_id).await?;
        let snapshot = self.exchange.parse_snapshot(trading_pair, &body)?;

        let book = Arc::new(OrderBook::new(trading_pair));
        let buffered = self
            .shared
            .saved_queues
            .lock()
            .get_mut(trading_pair)
            .map(|q| q.drain_into())
            .unwrap_or_default();
        let relevant_diffs: Vec<OrderBookMessage> = buffered
            .into_iter()
            .filter(|m| m.kind == OrderBookMessageKind::Diff)
            .collect();
        book.restore_from_snapshot_and_diffs(&snapshot, &relevant_diffs);

        self.shared
            .order_books
            .write()
            .insert(trading_pair.to_string(), book);
        self.shared
            .past_diffs
            .lock()
            .insert(trading_pair.to_string(), RingQueue::new(self.past_diffs_capacity));

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared
            .tracking_queues
            .lock()
            .insert(trading_pair.to_string(), tx);
        self.shared.initialized.write().insert(trading_pair.to_string());

        let worker_self = self.clone();
        let pair_owned = trading_pair.to_string();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                worker_self.track_single_book(&pair_owned, msg).await;
            }
        });
        self.shared.tasks.lock().insert(trading_pair.to_string(), task);

        Ok(())
    }

    fn route_diff(&self, msg: OrderBookMessage) {
        let initialized = self.shared.initialized.read().contains(&msg.trading_pair);
        if !initialized {
            let mut saved = self.shared.saved_queues.lock();
            if let Some(queue) = saved.get_mut(&msg.trading_pair) {
                queue.push(msg);
            }
            // Pair not tracked at all (never added, or removed): drop.
            return;
        }

        let book_uid = self
            .shared
            .order_books
            .read()
            .get(&msg.trading_pair)
            .map(|b| b.last_diff_uid());
        if let Some(last_uid) = book_uid {
            if msg.update_id <= last_uid {
                self.shared.rejected_diffs.fetch_add(1, Ordering::Relaxed);
                debug!(pair = %msg.trading_pair, update_id = msg.update_id, last_uid, "dropping stale diff");
                return;
            }
        }

        let queues = self.shared.tracking_queues.lock();
        if let Some(sender) = queues.get(&msg.trading_pair) {
            let _ = sender.send(msg);
        }
    }

    /// Routes a live WS snapshot (e.g. OKX's `books` channel resend) to its
    /// pair's worker. Unlike `route_diff`, nothing is buffered for a pair
    /// that isn't initialized yet — it's simply dropped, since `init_one`
    /// already fetched a REST snapshot for every pair before the router
    /// starts accepting messages.
    fn route_snapshot(&self, msg: OrderBookMessage) {
        let initialized = self.shared.initialized.read().contains(&msg.trading_pair);
        if !initialized {
            debug!(pair = %msg.trading_pair, "dropping live snapshot for untracked pair");
            return;
        }
        let queues = self.shared.tracking_queues.lock();
        if let Some(sender) = queues.get(&msg.trading_pair) {
            let _ = sender.send(msg);
        }
    }

    async fn track_single_book(&self, trading_pair: &str, msg: OrderBookMessage) {
        let Some(book) = self.order_book(trading_pair) else {
            return;
        };

        match msg.kind {
            OrderBookMessageKind::Diff => {
                if self.exchange.requires_sequence_continuity() {
                    if let Some(first_update_id) = msg.first_update_id {
                        let expected = book.last_diff_uid() + 1;
                        if first_update_id != expected {
                            warn!(
                                pair = trading_pair,
                                expected, got = first_update_id,
                                "sequence gap detected, resyncing"
                            );
                            self.resync(trading_pair).await;
                            return;
                        }
                    }
                }
                let update_id = msg.update_id;
                if book.apply_diffs(&msg.bids, &msg.asks, msg.update_id) {
                    if let Some(window) = self.shared.past_diffs.lock().get_mut(trading_pair) {
                        window.push(msg);
                    }
                    self.event_hub.publish(PipelineEvent::OrderBookDiffApplied {
                        trading_pair: trading_pair.to_string(),
                        update_id,
                    });
                }
            }
            OrderBookMessageKind::Snapshot => {
                let past = self
                    .shared
                    .past_diffs
                    .lock()
                    .get(trading_pair)
                    .map(|w| w.snapshot())
                    .unwrap_or_default();
                book.restore_from_snapshot_and_diffs(&msg, &past);
            }
            OrderBookMessageKind::Trade => {
                if let Some(content) = &msg.content {
                    book.apply_trade(content.price, Instant::now());
                }
            }
        }
    }

    /// Resync path: discard the book, reset the past-diffs window,
    /// re-issue a REST snapshot. Buffered diffs arriving in the interim
    /// route through `saved_queues` exactly like initial startup, because
    /// `initialized` is cleared first.
    async fn resync(&self, trading_pair: &str) {
        self.shared.initialized.write().remove(trading_pair);
        if let Some(window) = self.shared.past_diffs.lock().get_mut(trading_pair) {
            window.drain_into();
        }
        if let Some(book) = self.order_book(trading_pair) {
            book.reset();
        }
        let url = self.exchange.order_book_snapshot_url(trading_pair);
        let limits = self.exchange.rate_limits();
        let limit_id = limits
            .first()
            .map(|l| l.id.clone())
            .unwrap_or_else(|| "default".to_string());
        match self.rest.get(&url, &limit_id).await {
            Ok(body) => match self.exchange.parse_snapshot(trading_pair, &body) {
                Ok(snapshot) => {
                    let buffered = self
                        .shared
                        .saved_queues
                        .lock()
                        .get_mut(trading_pair)
                        .map(|q| q.drain_into())
                        .unwrap_or_default();
                    if let Some(book) = self.order_book(trading_pair) {
                        book.restore_from_snapshot_and_diffs(&snapshot, &buffered);
                    }
                    self.shared.initialized.write().insert(trading_pair.to_string());
                }
                Err(e) => warn!(pair = trading_pair, error = %e, "resync snapshot parse failed"),
            },
            Err(e) => warn!(pair = trading_pair, error = %e, "resync snapshot fetch failed"),
        }
    }

    async fn emit_trade_event_loop(&self, mut trade_rx: mpsc::UnboundedReceiver<OrderBookMessage>) {
        self.wait_ready().await;
        while let Some(msg) = trade_rx.recv().await {
            if !self.shared.initialized.read().contains(&msg.trading_pair) {
                continue;
            }
            if let Some(book) = self.order_book(&msg.trading_pair) {
                if let Some(content) = &msg.content {
                    book.apply_trade(content.price, Instant::now());
                    self.event_hub.publish(PipelineEvent::OrderBookTrade {
                        trading_pair: msg.trading_pair.clone(),
                        price: content.price,
                        amount: content.amount,
                        trade_type: content.trade_type,
                    });
                }
            }
        }
    }

    /// REST fallback for trade price: fires at most once per
    /// `trade_rest_refresh_min` per pair, for pairs whose last applied WS
    /// trade is older than `outdated_trade_age`.
    async fn update_last_trade_prices_loop(&self) {
        self.wait_ready().await;
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            let now = Instant::now();
            let outdated: Vec<String> = {
                let books = self.shared.order_books.read();
                books
                    .iter()
                    .filter(|(_, book)| {
                        let applied_stale = book
                            .last_applied_trade()
                            .map(|t| now.duration_since(t) > self.outdated_trade_age)
                            .unwrap_or(true);
                        let rest_stale = book
                            .last_trade_price_rest_updated()
                            .map(|t| now.duration_since(t) > self.trade_rest_refresh_min)
                            .unwrap_or(true);
                        applied_stale && rest_stale
                    })
                    .map(|(pair, _)| pair.clone())
                    .collect()
            };
            if outdated.is_empty() {
                continue;
            }
            let url = self.exchange.last_traded_price_url(&outdated);
            let limits = self.exchange.rate_limits();
            let limit_id = limits
                .iter()
                .find(|l| l.id.contains("ticker") || l.id.contains("price"))
                .or_else(|| limits.first())
                .map(|l| l.id.clone())
                .unwrap_or_else(|| "default".to_string());
            match self.rest.get(&url, &limit_id).await {
                Ok(body) => match self.exchange.parse_last_traded_prices(&body) {
                    Ok(prices) => {
                        let books = self.shared.order_books.read();
                        for (pair, price) in prices {
                            if let Some(book) = books.get(&pair) {
                                book.set_last_trade_price_from_rest(price, Instant::now());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse last-traded-price response"),
                },
                Err(e) => warn!(error = %e, "last-traded-price REST fallback failed"),
            }
        }
    }
}
