//! Funding-rate feed: REST polling on a wall-clock-aligned cadence, with an
//! optional WS push path, normalizing every rate onto a common time base.
//!
//! Polling cadence and the REST/WS split are `FundingRateBase`
//! (`examples/original_source/hummingbot/data_feed/fundingrate_feed/
//! fundingrate_base.py`); the normalization formula and its un-normalized
//! fallback are lifted from `binance_perpetual_fundingrates.py`'s
//! `_parse_rest_fundingrates`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::event_hub::{EventHub, PipelineEvent};
use crate::exchange::{ExchangeAdapter, RawFundingInfo};
use crate::web_assistant::ws::reconnect_with_backoff;
use crate::web_assistant::{BackoffCalculator, RestAssistant, WsAssistant};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A normalized funding rate plus the bookkeeping needed to know whether
/// it was actually normalized or cached as-is.
#[derive(Debug, Clone, Copy)]
pub struct FundingInfo {
    pub rate: Decimal,
    pub normalized: bool,
    pub updated_at: Instant,
}

struct State {
    rates: RwLock<HashMap<String, FundingInfo>>,
    ready: AtomicBool,
    last_update: RwLock<Option<Instant>>,
}

/// Normalizes `raw` reported over `interval_hours` onto `standardization_hours`.
/// Falls back to the un-normalized `raw` rate when the exchange didn't report
/// an interval — the caller is told via the `bool` whether that happened.
pub fn normalize(raw: Decimal, interval_hours: Option<i64>, standardization_hours: i64) -> (Decimal, bool) {
    match interval_hours {
        Some(hours) if hours > 0 => {
            let factor = Decimal::from(standardization_hours) / Decimal::from(hours);
            (raw * factor, true)
        }
        _ => (raw, false),
    }
}

pub struct FundingRateFeed<A: ExchangeAdapter + 'static> {
    exchange: Arc<A>,
    rest: Arc<RestAssistant>,
    standardization_hours: i64,
    poll_interval: Duration,
    ws_message_timeout: Duration,
    ws_connection_timeout: Duration,
    event_hub: Arc<EventHub>,
    state: Arc<State>,
}

impl<A: ExchangeAdapter + 'static> FundingRateFeed<A> {
    pub fn new(
        exchange: Arc<A>,
        rest: Arc<RestAssistant>,
        standardization_hours: i64,
        poll_interval: Duration,
        ws_message_timeout: Duration,
        ws_connection_timeout: Duration,
        event_hub: Arc<EventHub>,
    ) -> Self {
        Self {
            exchange,
            rest,
            standardization_hours,
            poll_interval,
            ws_message_timeout,
            ws_connection_timeout,
            event_hub,
            state: Arc::new(State {
                rates: RwLock::new(HashMap::new()),
                ready: AtomicBool::new(false),
                last_update: RwLock::new(None),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn funding_rate(&self, trading_pair: &str) -> Option<FundingInfo> {
        self.state.rates.read().get(trading_pair).copied()
    }

    pub fn funding_rates(&self) -> HashMap<String, FundingInfo> {
        self.state.rates.read().clone()
    }

    pub fn last_update_time(&self) -> Option<Instant> {
        *self.state.last_update.read()
    }

    /// Spawns the wall-clock-aligned polling loop; returns its handle so
    /// the caller can hold or abort it.
    pub fn spawn_poll_loop(self: &Arc<Self>, trading_pairs: Vec<String>) -> tokio::task::JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            feed.fetch_fundingrates_loop(trading_pairs).await;
        })
    }

    /// Spawns the funding push-channel listener, if the adapter exposes
    /// one (`ws_funding_subscribe_payload` returns `Some`). Returns `None`
    /// for an adapter that is REST-poll only, leaving `spawn_poll_loop` as
    /// the sole update path.
    pub fn spawn_ws_listen_loop(self: &Arc<Self>, trading_pairs: Vec<String>) -> Option<tokio::task::JoinHandle<()>> {
        self.exchange.ws_funding_subscribe_payload(&trading_pairs)?;
        let feed = self.clone();
        Some(tokio::spawn(async move {
            feed.listen_for_subscriptions(trading_pairs).await;
        }))
    }

    /// Restart loop: connect, subscribe, and feed every frame to
    /// `apply_ws_frame`, reconnecting with jittered backoff on any
    /// disconnect or I/O error. Independent of the order book market data
    /// connection — its own socket, its own subscribe payload.
    async fn listen_for_subscriptions(&self, trading_pairs: Vec<String>) {
        let mut backoff = BackoffCalculator::new(BACKOFF_BASE, BACKOFF_CAP);
        loop {
            let result = reconnect_with_backoff(&mut backoff, 1, || self.run_ws_connection(&trading_pairs)).await;
            if let Err(e) = result {
                warn!(error = %e, "funding ws listener connection attempt failed, retrying");
            }
        }
    }

    async fn run_ws_connection(&self, trading_pairs: &[String]) -> PipelineResult<()> {
        let Some(payload) = self.exchange.ws_funding_subscribe_payload(trading_pairs) else {
            return Ok(());
        };
        let mut ws = WsAssistant::new(self.ws_message_timeout);
        ws.connect(self.exchange.ws_url(), self.ws_connection_timeout).await?;
        ws.send(payload).await?;

        let outcome = loop {
            match ws.recv().await {
                Ok(Some(raw)) => self.apply_ws_frame(&raw),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        ws.disconnect().await;
        outcome
    }

    /// Sleeps until the next wall-clock boundary (`interval - now % interval`)
    /// before every fetch, so polls line up across process restarts instead
    /// of drifting from process-start time.
    async fn fetch_fundingrates_loop(&self, trading_pairs: Vec<String>) {
        loop {
            let delta = wall_clock_delta(self.poll_interval);
            tokio::time::sleep(delta).await;
            self.fetch_fundingrates(&trading_pairs).await;
        }
    }

    async fn fetch_fundingrates(&self, trading_pairs: &[String]) {
        for pair in trading_pairs {
            let url = self.exchange.funding_info_rest_url(pair);
            let limits = self.exchange.rate_limits();
            let limit_id = limits
                .iter()
                .find(|l| l.id.to_lowercase().contains("funding"))
                .or_else(|| limits.first())
                .map(|l| l.id.clone())
                .unwrap_or_else(|| "default".to_string());
            match self.rest.get(&url, &limit_id).await {
                Ok(body) => match self.exchange.parse_funding_rest(&body) {
                    Ok(raw) => self.apply_raw(pair, raw),
                    Err(e) => warn!(pair, error = %e, "failed to parse funding rate response"),
                },
                Err(e) => warn!(pair, error = %e, "funding rate fetch failed"),
            }
        }
        self.state.ready.store(true, Ordering::Release);
        *self.state.last_update.write() = Some(Instant::now());
    }

    fn apply_raw(&self, trading_pair: &str, raw: RawFundingInfo) {
        let (rate, normalized) = normalize(raw.rate, raw.interval_hours, self.standardization_hours);
        debug!(trading_pair, %rate, normalized, "funding rate updated");
        self.state.rates.write().insert(
            trading_pair.to_string(),
            FundingInfo {
                rate,
                normalized,
                updated_at: Instant::now(),
            },
        );
        self.event_hub.publish(PipelineEvent::FundingRateUpdated {
            trading_pair: trading_pair.to_string(),
            rate,
        });
    }

    /// Feeds a push-channel funding frame (e.g. Binance's `!markPrice@arr`)
    /// straight into the cache, bypassing the REST poll for symbols it
    /// covers.
    pub fn apply_ws_frame(&self, payload: &str) {
        match self.exchange.parse_funding_ws(payload) {
            Ok(entries) => {
                for (pair, raw) in entries {
                    self.apply_raw(&pair, raw);
                }
                self.state.ready.store(true, Ordering::Release);
                *self.state.last_update.write() = Some(Instant::now());
            }
            Err(e) => warn!(error = %e, "failed to parse funding ws frame"),
        }
    }
}

fn wall_clock_delta(interval: Duration) -> Duration {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let interval_secs = interval.as_secs_f64().max(0.001);
    let now_secs = now.as_secs_f64();
    let remainder = now_secs % interval_secs;
    Duration::from_secs_f64(interval_secs - remainder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalizes_with_known_interval() {
        // raw=0.0001, interval=8h, std=24h -> 0.0003
        let (rate, normalized) = normalize(dec!(0.0001), Some(8), 24);
        assert!(normalized);
        assert_eq!(rate, dec!(0.0003));
    }

    #[test]
    fn falls_back_to_unnormalized_when_interval_unknown() {
        let (rate, normalized) = normalize(dec!(0.0001), None, 24);
        assert!(!normalized);
        assert_eq!(rate, dec!(0.0001));
    }

    #[test]
    fn wall_clock_delta_is_within_interval() {
        let delta = wall_clock_delta(Duration::from_secs(10));
        assert!(delta <= Duration::from_secs(10));
    }

    fn build_feed(exchange: crate::exchange::MockExchangeAdapter) -> Arc<FundingRateFeed<crate::exchange::MockExchangeAdapter>> {
        let exchange = Arc::new(exchange);
        let limiter = Arc::new(crate::rate_limiter::RateLimiter::new(
            exchange.rate_limits(),
            0.0,
            Duration::from_millis(5),
        ));
        let rest = Arc::new(RestAssistant::new(limiter).unwrap());
        Arc::new(FundingRateFeed::new(
            exchange,
            rest,
            24,
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(30),
            Arc::new(EventHub::new()),
        ))
    }

    #[test]
    fn ws_listen_loop_is_not_spawned_without_a_push_channel() {
        let feed = build_feed(crate::exchange::MockExchangeAdapter::new(false));
        assert!(feed.spawn_ws_listen_loop(vec!["A".to_string()]).is_none());
    }

    #[tokio::test]
    async fn apply_ws_frame_publishes_funding_rate_update() {
        let feed = build_feed(crate::exchange::MockExchangeAdapter::new(false));
        let (mut events, _handle) = feed.event_hub.subscribe();
        feed.apply_ws_frame(r#"[{"trading_pair":"A","rate":"0.0001","interval_hours":8}]"#);
        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PipelineEvent::FundingRateUpdated { trading_pair, .. } => assert_eq!(trading_pair, "A"),
            _ => panic!("unexpected event"),
        }
        assert!(feed.is_ready());
    }
}
