//! In-memory adapter used by tracker/funding integration tests. Parsers
//! accept `serde_json` payloads shaped like `OrderBookMessage`/`RawFundingInfo`
//! directly, sidestepping any real wire format.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::{ExchangeAdapter, FrameKind, RawFundingInfo};
use crate::error::PipelineResult;
use crate::order_book::{Level, OrderBookMessage, OrderBookMessageKind, TradeContent, TradeType};
use crate::rate_limiter::RateLimit;

pub struct MockExchangeAdapter {
    pub sequence_continuity: bool,
    base_url: String,
}

impl MockExchangeAdapter {
    pub fn new(sequence_continuity: bool) -> Self {
        Self {
            sequence_continuity,
            base_url: "http://mock.invalid".to_string(),
        }
    }

    /// Points REST URL builders at a local stub server instead of
    /// `mock.invalid`, for integration tests that exercise the real
    /// `RestAssistant` HTTP path.
    pub fn with_base_url(sequence_continuity: bool, base_url: impl Into<String>) -> Self {
        Self {
            sequence_continuity,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct WireMessage {
    kind: String,
    trading_pair: String,
    timestamp: u64,
    #[serde(default)]
    update_id: u64,
    #[serde(default)]
    first_update_id: Option<u64>,
    #[serde(default)]
    bids: Vec<Level>,
    #[serde(default)]
    asks: Vec<Level>,
    #[serde(default)]
    trade_id: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    is_buy: Option<bool>,
}

impl ExchangeAdapter for MockExchangeAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn rest_base_url(&self) -> &str {
        &self.base_url
    }

    fn ws_url(&self) -> &str {
        "ws://mock.invalid"
    }

    fn order_book_snapshot_url(&self, trading_pair: &str) -> String {
        format!("{}/snapshot/{trading_pair}", self.base_url)
    }

    fn last_traded_price_url(&self, _trading_pairs: &[String]) -> String {
        format!("{}/prices", self.base_url)
    }

    fn funding_info_rest_url(&self, trading_pair: &str) -> String {
        format!("{}/funding/{trading_pair}", self.base_url)
    }

    fn ws_subscribe_payload(&self, trading_pairs: &[String]) -> String {
        trading_pairs.join(",")
    }

    fn ws_funding_subscribe_payload(&self, _trading_pairs: &[String]) -> Option<String> {
        None
    }

    fn exchange_symbol(&self, trading_pair: &str) -> String {
        trading_pair.to_string()
    }

    fn trading_pair_from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String> {
        Some(exchange_symbol.to_string())
    }

    fn rate_limits(&self) -> Vec<RateLimit> {
        vec![RateLimit::new("mock", 1_000_000, Duration::from_secs(1))]
    }

    fn requires_sequence_continuity(&self) -> bool {
        self.sequence_continuity
    }

    fn classify_frame(&self, raw: &str) -> Option<FrameKind> {
        let value: Value = serde_json::from_str(raw).ok()?;
        match value.get("kind")?.as_str()? {
            "snapshot" => Some(FrameKind::Snapshot),
            "diff" => Some(FrameKind::Diff),
            "trade" => Some(FrameKind::Trade),
            "funding" => Some(FrameKind::Funding),
            _ => None,
        }
    }

    fn parse_snapshot(&self, _trading_pair: &str, payload: &str) -> PipelineResult<OrderBookMessage> {
        self.parse_diff(payload)
    }

    fn parse_diff(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let wire: WireMessage = serde_json::from_str(payload)?;
        Ok(match wire.kind.as_str() {
            "snapshot" => OrderBookMessage::snapshot(
                wire.trading_pair,
                wire.timestamp,
                wire.update_id,
                wire.bids,
                wire.asks,
            ),
            _ => OrderBookMessage {
                kind: OrderBookMessageKind::Diff,
                trading_pair: wire.trading_pair,
                timestamp: wire.timestamp,
                update_id: wire.update_id,
                first_update_id: wire.first_update_id,
                bids: wire.bids,
                asks: wire.asks,
                content: None,
            },
        })
    }

    fn parse_trade(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let wire: WireMessage = serde_json::from_str(payload)?;
        Ok(OrderBookMessage {
            kind: OrderBookMessageKind::Trade,
            trading_pair: wire.trading_pair,
            timestamp: wire.timestamp,
            update_id: 0,
            first_update_id: None,
            bids: Vec::new(),
            asks: Vec::new(),
            content: Some(TradeContent {
                price: wire.price.unwrap_or_default(),
                amount: wire.amount.unwrap_or_default(),
                trade_type: if wire.is_buy.unwrap_or(true) {
                    TradeType::Buy
                } else {
                    TradeType::Sell
                },
                trade_id: wire.trade_id.unwrap_or_default(),
            }),
        })
    }

    fn parse_last_traded_prices(&self, payload: &str) -> PipelineResult<Vec<(String, Decimal)>> {
        Ok(serde_json::from_str(payload)?)
    }

    fn parse_funding_rest(&self, payload: &str) -> PipelineResult<RawFundingInfo> {
        #[derive(Deserialize)]
        struct Wire {
            rate: Decimal,
            interval_hours: Option<i64>,
        }
        let wire: Wire = serde_json::from_str(payload)?;
        Ok(RawFundingInfo {
            rate: wire.rate,
            interval_hours: wire.interval_hours,
        })
    }

    fn parse_funding_ws(&self, payload: &str) -> PipelineResult<Vec<(String, RawFundingInfo)>> {
        #[derive(Deserialize)]
        struct Wire {
            trading_pair: String,
            rate: Decimal,
            interval_hours: Option<i64>,
        }
        let entries: Vec<Wire> = serde_json::from_str(payload)?;
        Ok(entries
            .into_iter()
            .map(|w| {
                (
                    w.trading_pair,
                    RawFundingInfo {
                        rate: w.rate,
                        interval_hours: w.interval_hours,
                    },
                )
            })
            .collect())
    }
}
