//! Thin runner: wires one exchange adapter through the order book tracker
//! and funding feed, and logs every trade/funding update it sees.
//!
//! No inbound HTTP surface — this crate is a library consumed by a
//! strategy process, so the demo's only job is to prove the pipeline wires
//! together end to end.

use std::sync::Arc;

use market_pipeline::event_hub::EventHub;
use market_pipeline::exchange::{BinancePerpetualAdapter, ExchangeAdapter};
use market_pipeline::funding::FundingRateFeed;
use market_pipeline::rate_limiter::RateLimiter;
use market_pipeline::source::MarketDataSource;
use market_pipeline::tracker::OrderBookTracker;
use market_pipeline::web_assistant::RestAssistant;
use market_pipeline::PipelineConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = PipelineConfig::from_env();
    let trading_pairs = if config.trading_pairs.is_empty() {
        vec!["BTC-USDT".to_string()]
    } else {
        config.trading_pairs.clone()
    };

    let exchange = Arc::new(BinancePerpetualAdapter::new());
    let limiter = Arc::new(RateLimiter::new(
        exchange.rate_limits(),
        config.safety_margin_pct,
        config.rate_limiter_retry_interval(),
    ));
    let rest = match RestAssistant::new(limiter) {
        Ok(rest) => Arc::new(rest),
        Err(e) => {
            tracing::error!(error = %e, "failed to build rest assistant");
            return;
        }
    };

    let event_hub = Arc::new(EventHub::new());

    let tracker = Arc::new(OrderBookTracker::new(
        exchange.clone(),
        rest.clone(),
        config.saved_message_queue_size,
        config.past_diffs_window_size,
        config.outdated_trade_age(),
        config.trade_rest_refresh_min(),
        event_hub.clone(),
    ));

    let source = Arc::new(MarketDataSource::new(
        exchange.clone(),
        rest.clone(),
        config.ws_message_timeout(),
        config.ws_connection_timeout(),
        config.snapshot_timeout(),
    ));
    let (diff_tx, diff_rx) = tokio::sync::mpsc::unbounded_channel();
    let (trade_tx, trade_rx) = tokio::sync::mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = tokio::sync::mpsc::unbounded_channel();

    let subscription_source = source.clone();
    let subscription_pairs = trading_pairs.clone();
    let _subscription_task = tokio::spawn(async move {
        subscription_source.listen_for_subscriptions(subscription_pairs).await;
    });
    let diff_source = source.clone();
    let _diff_drain_task = tokio::spawn(async move {
        diff_source.listen_for_order_book_diffs(diff_tx).await;
    });
    let trade_source = source.clone();
    let _trade_drain_task = tokio::spawn(async move {
        trade_source.listen_for_order_book_trades(trade_tx).await;
    });
    let snapshot_source = source.clone();
    let snapshot_pairs = trading_pairs.clone();
    let _snapshot_drain_task = tokio::spawn(async move {
        snapshot_source
            .listen_for_order_book_snapshots(snapshot_pairs, snapshot_tx)
            .await;
    });

    if let Err(e) = tracker
        .start(trading_pairs.clone(), diff_rx, trade_rx, snapshot_rx)
        .await
    {
        tracing::error!(error = %e, "tracker failed to start");
        return;
    }
    tracing::info!(ready = tracker.is_ready(), "order book tracker started");

    let funding = Arc::new(FundingRateFeed::new(
        exchange.clone(),
        rest.clone(),
        config.standardization_duration_hours,
        config.rest_update_interval(),
        config.ws_message_timeout(),
        config.ws_connection_timeout(),
        event_hub.clone(),
    ));
    let _funding_poll_task = funding.spawn_poll_loop(trading_pairs.clone());
    let _funding_ws_task = funding.spawn_ws_listen_loop(trading_pairs);

    tokio::signal::ctrl_c().await.ok();
    tracker.stop().await;
}
