//! Market data source: owns the live WS connection for one exchange,
//! classifies inbound frames into per-channel queues, and turns drained
//! frames into the neutral messages the tracker consumes.
//!
//! The channel-keyed internal queue / per-channel drain shape is
//! `PerpetualAPIOrderBookDataSource` (`examples/original_source/hummingbot/
//! core/data_type/perpetual_api_order_book_data_source.py`); the
//! connect-subscribe-classify loop with jittered reconnect backoff is
//! `order_book_tracker.py`'s `listen_for_subscriptions` pattern, narrowed
//! onto `WsAssistant`/`reconnect_with_backoff`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::exchange::{ExchangeAdapter, FrameKind};
use crate::order_book::{OrderBookMessage, OrderBookMessageKind};
use crate::web_assistant::ws::reconnect_with_backoff;
use crate::web_assistant::{BackoffCalculator, RestAssistant, WsAssistant};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

struct ChannelQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ChannelQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Takes the receiving half. Each queue has exactly one owning drain
    /// task; `None` means a second caller already took it.
    fn take_rx(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().take()
    }
}

/// Owns one exchange's live WS feed. `listen_for_subscriptions` drives the
/// connection; the three `listen_for_order_book_*` methods each drain one
/// channel-keyed queue and forward parsed messages onto the tracker's
/// global ingress streams. Every method here is meant to run as its own
/// spawned task for the lifetime of the pipeline.
pub struct MarketDataSource<A: ExchangeAdapter + 'static> {
    exchange: Arc<A>,
    rest: Arc<RestAssistant>,
    message_timeout: Duration,
    connection_timeout: Duration,
    snapshot_timeout: Duration,
    snapshot_queue: ChannelQueue,
    diff_queue: ChannelQueue,
    trade_queue: ChannelQueue,
}

impl<A: ExchangeAdapter + 'static> MarketDataSource<A> {
    pub fn new(
        exchange: Arc<A>,
        rest: Arc<RestAssistant>,
        message_timeout: Duration,
        connection_timeout: Duration,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            rest,
            message_timeout,
            connection_timeout,
            snapshot_timeout,
            snapshot_queue: ChannelQueue::new(),
            diff_queue: ChannelQueue::new(),
            trade_queue: ChannelQueue::new(),
        }
    }

    /// Restart loop: connect, subscribe, classify every inbound frame into
    /// its channel queue, and reconnect with jittered backoff (capped at
    /// 30s) on any disconnect or I/O error. Runs until the task is aborted.
    pub async fn listen_for_subscriptions(&self, trading_pairs: Vec<String>) {
        let mut backoff = BackoffCalculator::new(BACKOFF_BASE, BACKOFF_CAP);
        loop {
            let result = reconnect_with_backoff(&mut backoff, 1, || self.run_connection(&trading_pairs)).await;
            if let Err(e) = result {
                warn!(error = %e, "market data source connection attempt failed, retrying");
            }
        }
    }

    async fn run_connection(&self, trading_pairs: &[String]) -> PipelineResult<()> {
        let mut ws = WsAssistant::new(self.message_timeout);
        ws.connect(self.exchange.ws_url(), self.connection_timeout).await?;
        ws.send(self.exchange.ws_subscribe_payload(trading_pairs)).await?;

        let outcome = loop {
            match ws.recv().await {
                Ok(Some(raw)) => self.classify_and_dispatch(&raw),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        ws.disconnect().await;
        outcome
    }

    fn classify_and_dispatch(&self, raw: &str) {
        match self.exchange.classify_frame(raw) {
            Some(FrameKind::Snapshot) => {
                let _ = self.snapshot_queue.tx.send(raw.to_string());
            }
            Some(FrameKind::Diff) => {
                let _ = self.diff_queue.tx.send(raw.to_string());
            }
            Some(FrameKind::Trade) => {
                let _ = self.trade_queue.tx.send(raw.to_string());
            }
            Some(FrameKind::Funding) => {
                debug!("dropping funding frame on order book market data connection");
            }
            None => {
                debug!(len = raw.len(), "dropping unclassified frame");
            }
        }
    }

    /// Drains classified diff frames, parses each with the adapter, and
    /// forwards it to `out` (the tracker's global diff ingress).
    pub async fn listen_for_order_book_diffs(&self, out: mpsc::UnboundedSender<OrderBookMessage>) {
        let Some(mut rx) = self.diff_queue.take_rx() else {
            warn!("diff queue already drained by another task");
            return;
        };
        while let Some(raw) = rx.recv().await {
            match self.exchange.parse_diff(&raw) {
                Ok(msg) => {
                    let _ = out.send(msg);
                }
                Err(e) => warn!(error = %e, "failed to parse order book diff frame"),
            }
        }
    }

    /// Drains classified trade frames into `out` (the tracker's global
    /// trade ingress).
    pub async fn listen_for_order_book_trades(&self, out: mpsc::UnboundedSender<OrderBookMessage>) {
        let Some(mut rx) = self.trade_queue.take_rx() else {
            warn!("trade queue already drained by another task");
            return;
        };
        while let Some(raw) = rx.recv().await {
            match self.exchange.parse_trade(&raw) {
                Ok(msg) => {
                    let _ = out.send(msg);
                }
                Err(e) => warn!(error = %e, "failed to parse trade frame"),
            }
        }
    }

    /// Drains classified snapshot frames (reused through `parse_diff`,
    /// since adapters like OKX disambiguate snapshot vs diff from the same
    /// frame shape) into `out`. Any pair in `trading_pairs` that hasn't
    /// produced a WS snapshot within `snapshot_timeout` is proactively
    /// fetched over REST instead, so a missing or delayed WS snapshot never
    /// stalls tracker init.
    pub async fn listen_for_order_book_snapshots(
        &self,
        trading_pairs: Vec<String>,
        out: mpsc::UnboundedSender<OrderBookMessage>,
    ) {
        let Some(mut rx) = self.snapshot_queue.take_rx() else {
            warn!("snapshot queue already drained by another task");
            return;
        };
        let mut pending: HashSet<String> = trading_pairs.into_iter().collect();

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(raw) => self.handle_snapshot_frame(raw, &mut pending, &out).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(self.snapshot_timeout), if !pending.is_empty() => {
                    let stale: Vec<String> = pending.iter().cloned().collect();
                    for pair in stale {
                        self.fetch_rest_snapshot(&pair, &out).await;
                        pending.remove(&pair);
                    }
                }
            }
        }
    }

    async fn handle_snapshot_frame(
        &self,
        raw: String,
        pending: &mut HashSet<String>,
        out: &mpsc::UnboundedSender<OrderBookMessage>,
    ) {
        match self.exchange.parse_diff(&raw) {
            Ok(msg) if msg.kind == OrderBookMessageKind::Snapshot => {
                pending.remove(&msg.trading_pair);
                let _ = out.send(msg);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to parse snapshot frame"),
        }
    }

    async fn fetch_rest_snapshot(&self, trading_pair: &str, out: &mpsc::UnboundedSender<OrderBookMessage>) {
        let url = self.exchange.order_book_snapshot_url(trading_pair);
        let limits = self.exchange.rate_limits();
        let limit_id = limits.first().map(|l| l.id.clone()).unwrap_or_else(|| "default".to_string());
        match self.rest.get(&url, &limit_id).await {
            Ok(body) => match self.exchange.parse_snapshot(trading_pair, &body) {
                Ok(msg) => {
                    let _ = out.send(msg);
                }
                Err(e) => warn!(pair = trading_pair, error = %e, "failed to parse REST snapshot fallback"),
            },
            Err(e) => warn!(pair = trading_pair, error = %e, "REST snapshot fallback fetch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeAdapter;
    use crate::rate_limiter::RateLimiter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Bare-bones HTTP stub answering every request with the same body,
    /// just enough to drive the REST snapshot fallback in a test.
    async fn spawn_stub(body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = body.to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn build_source(adapter: MockExchangeAdapter) -> MarketDataSource<MockExchangeAdapter> {
        let adapter = Arc::new(adapter);
        let limiter = Arc::new(RateLimiter::new(
            adapter.rate_limits(),
            0.0,
            Duration::from_millis(5),
        ));
        let rest = Arc::new(RestAssistant::new(limiter).unwrap());
        MarketDataSource::new(
            adapter,
            rest,
            Duration::from_secs(30),
            Duration::from_secs(10),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn classify_and_dispatch_routes_by_kind() {
        let source = build_source(MockExchangeAdapter::new(false));
        source.classify_and_dispatch(r#"{"kind":"diff","trading_pair":"A","timestamp":0,"update_id":1,"bids":[],"asks":[]}"#);
        source.classify_and_dispatch(r#"{"kind":"trade","trading_pair":"A","timestamp":0,"price":"1","amount":"1"}"#);
        source.classify_and_dispatch(r#"{"kind":"unknown","trading_pair":"A","timestamp":0}"#);

        let (diff_tx, mut diff_rx) = mpsc::unbounded_channel();
        let diffs = tokio::spawn({
            let mut rx = source.diff_queue.take_rx().unwrap();
            async move {
                if let Some(raw) = rx.recv().await {
                    let _ = diff_tx.send(raw);
                }
            }
        });
        diffs.await.unwrap();
        assert!(diff_rx.recv().await.is_some());

        let mut trade_rx = source.trade_queue.take_rx().unwrap();
        assert!(trade_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn snapshot_timeout_falls_back_to_rest() {
        let snapshot_body = r#"{"kind":"snapshot","trading_pair":"A","timestamp":0,"update_id":1,"bids":[],"asks":[]}"#;
        let base_url = spawn_stub(snapshot_body).await;
        let source = build_source(MockExchangeAdapter::with_base_url(false, base_url));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            source.listen_for_order_book_snapshots(vec!["A".to_string()], out_tx).await;
        });

        let msg = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .expect("rest fallback should fire")
            .expect("channel should be open");
        assert_eq!(msg.kind, OrderBookMessageKind::Snapshot);
        assert_eq!(msg.trading_pair, "A");
        handle.abort();
    }
}
