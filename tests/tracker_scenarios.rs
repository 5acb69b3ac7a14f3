mod common;

use std::sync::Arc;
use std::time::Duration;

use market_pipeline::event_hub::EventHub;
use market_pipeline::exchange::{ExchangeAdapter, MockExchangeAdapter};
use market_pipeline::order_book::OrderBookMessage;
use market_pipeline::rate_limiter::RateLimiter;
use market_pipeline::tracker::OrderBookTracker;
use market_pipeline::web_assistant::RestAssistant;

fn diff_payload(trading_pair: &str, update_id: u64, bids: &str, asks: &str) -> String {
    format!(
        r#"{{"kind":"diff","trading_pair":"{trading_pair}","timestamp":0,"update_id":{update_id},"bids":{bids},"asks":{asks}}}"#
    )
}

fn send_diff(tx: &tokio::sync::mpsc::UnboundedSender<OrderBookMessage>, payload: String) {
    let adapter = MockExchangeAdapter::new(false);
    let msg = adapter.parse_diff(&payload).expect("payload should parse");
    tx.send(msg).expect("diff channel should be open");
}

/// Diffs for 11/12 arrive before the pair finishes REST init; a snapshot
/// at update_id=11 should leave the book with last_diff_uid=12 after
/// replaying the one buffered diff newer than the snapshot.
#[tokio::test]
async fn late_snapshot_reconciliation() {
    let snapshot_body = r#"{"kind":"snapshot","trading_pair":"BTC-USDT","timestamp":0,"update_id":11,"bids":[[100,1]],"asks":[[101,1]]}"#;
    let (base_url, _server) = common::spawn_stub(snapshot_body).await;

    let adapter = Arc::new(MockExchangeAdapter::with_base_url(false, base_url));
    let limiter = Arc::new(RateLimiter::new(
        adapter.rate_limits(),
        0.0,
        Duration::from_millis(5),
    ));
    let rest = Arc::new(RestAssistant::new(limiter).unwrap());
    let tracker = Arc::new(OrderBookTracker::new(
        adapter,
        rest,
        1000,
        32,
        Duration::from_secs(180),
        Duration::from_secs(5),
        Arc::new(EventHub::new()),
    ));

    let (diff_tx, diff_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_trade_tx, trade_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_snapshot_tx, snapshot_rx) = tokio::sync::mpsc::unbounded_channel();

    let started = tracker.clone();
    let start_task = tokio::spawn(async move {
        started
            .start(vec!["BTC-USDT".to_string()], diff_rx, trade_rx, snapshot_rx)
            .await
            .unwrap();
    });

    tokio::task::yield_now().await;
    send_diff(&diff_tx, diff_payload("BTC-USDT", 11, "[[99,1]]", "[]"));
    send_diff(&diff_tx, diff_payload("BTC-USDT", 12, "[[98,2]]", "[]"));

    start_task.await.unwrap();
    tracker.wait_ready().await;

    let book = tracker.order_book("BTC-USDT").expect("book should exist");
    assert_eq!(book.snapshot_uid(), 11);
    assert_eq!(book.last_diff_uid(), 12);
}

/// Removing a pair must stop any further diff for it from reaching a
/// book, with no panic and no task left running against it.
#[tokio::test]
async fn dynamic_pair_removal_drops_future_diffs() {
    let snapshot_body = r#"{"kind":"snapshot","trading_pair":"A","timestamp":0,"update_id":1,"bids":[],"asks":[]}"#;
    let (base_url, _server) = common::spawn_stub(snapshot_body).await;

    let adapter = Arc::new(MockExchangeAdapter::with_base_url(false, base_url));
    let limiter = Arc::new(RateLimiter::new(
        adapter.rate_limits(),
        0.0,
        Duration::from_millis(5),
    ));
    let rest = Arc::new(RestAssistant::new(limiter).unwrap());
    let tracker = Arc::new(OrderBookTracker::new(
        adapter,
        rest,
        1000,
        32,
        Duration::from_secs(180),
        Duration::from_secs(5),
        Arc::new(EventHub::new()),
    ));

    let (diff_tx, diff_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_trade_tx, trade_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_snapshot_tx, snapshot_rx) = tokio::sync::mpsc::unbounded_channel();

    tracker
        .start(vec!["A".to_string(), "B".to_string()], diff_rx, trade_rx, snapshot_rx)
        .await
        .unwrap();

    tracker.remove_trading_pair("B");
    assert!(tracker.order_book("B").is_none());

    send_diff(&diff_tx, diff_payload("B", 99, "[[1,1]]", "[]"));
    tokio::task::yield_now().await;

    assert!(tracker.order_book("B").is_none());
    assert!(tracker.order_book("A").is_some());
}

/// A snapshot routed through the live snapshot stream (not the REST init
/// path) must still reach `track_single_book` and replace the book, and
/// applying it plus a subsequent diff/trade must publish on the event hub.
#[tokio::test]
async fn live_snapshot_and_events_reach_subscribers() {
    let snapshot_body = r#"{"kind":"snapshot","trading_pair":"A","timestamp":0,"update_id":1,"bids":[],"asks":[]}"#;
    let (base_url, _server) = common::spawn_stub(snapshot_body).await;

    let adapter = Arc::new(MockExchangeAdapter::with_base_url(false, base_url));
    let limiter = Arc::new(RateLimiter::new(
        adapter.rate_limits(),
        0.0,
        Duration::from_millis(5),
    ));
    let rest = Arc::new(RestAssistant::new(limiter).unwrap());
    let event_hub = Arc::new(EventHub::new());
    let (mut events, _handle) = event_hub.subscribe();
    let tracker = Arc::new(OrderBookTracker::new(
        adapter,
        rest,
        1000,
        32,
        Duration::from_secs(180),
        Duration::from_secs(5),
        event_hub,
    ));

    let (diff_tx, diff_rx) = tokio::sync::mpsc::unbounded_channel();
    let (trade_tx, trade_rx) = tokio::sync::mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = tokio::sync::mpsc::unbounded_channel();

    tracker
        .start(vec!["A".to_string()], diff_rx, trade_rx, snapshot_rx)
        .await
        .unwrap();

    let adapter_for_parse = MockExchangeAdapter::new(false);
    let live_snapshot = r#"{"kind":"snapshot","trading_pair":"A","timestamp":0,"update_id":5,"bids":[[10,1]],"asks":[]}"#;
    let msg = adapter_for_parse.parse_diff(live_snapshot).unwrap();
    snapshot_tx.send(msg).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let book = tracker.order_book("A").expect("book should exist");
    assert_eq!(book.snapshot_uid(), 5);

    send_diff(&diff_tx, diff_payload("A", 6, "[[9,1]]", "[]"));
    let trade_payload = r#"{"kind":"trade","trading_pair":"A","timestamp":0,"price":10,"amount":1,"is_buy":true}"#;
    let trade_msg = adapter_for_parse.parse_trade(trade_payload).unwrap();
    trade_tx.send(trade_msg).unwrap();

    let mut saw_diff = false;
    let mut saw_trade = false;
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(market_pipeline::event_hub::PipelineEvent::OrderBookDiffApplied { .. })) => saw_diff = true,
            Ok(Some(market_pipeline::event_hub::PipelineEvent::OrderBookTrade { .. })) => saw_trade = true,
            _ => break,
        }
    }
    assert!(saw_diff, "diff application should publish an event");
    assert!(saw_trade, "trade application should publish an event");
}
