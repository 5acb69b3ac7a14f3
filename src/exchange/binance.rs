//! Binance USDT-M Futures adapter.
//!
//! Wire shapes and the `!markPrice@arr` funding push channel are taken
//! from `examples/original_source/hummingbot/data_feed/fundingrate_feed/
//! binance_perpetual_fundingrates/binance_perpetual_fundingrates.py`; diff
//! `U`/`u` sequencing is this exchange's reason for
//! `requires_sequence_continuity() == true`.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::{ExchangeAdapter, FrameKind, RawFundingInfo};
use crate::error::{PipelineError, PipelineResult};
use crate::order_book::{Level, OrderBookMessage, TradeType};
use crate::rate_limiter::RateLimit;

const REST_BASE_URL: &str = "https://fapi.binance.com";
const WS_URL: &str = "wss://fstream.binance.com/stream";

pub struct BinancePerpetualAdapter;

impl BinancePerpetualAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BinancePerpetualAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn levels_from_pairs(raw: &[Value]) -> Vec<Level> {
    raw.iter()
        .filter_map(|entry| {
            let pair = entry.as_array()?;
            let price: Decimal = pair.first()?.as_str()?.parse().ok()?;
            let size: Decimal = pair.get(1)?.as_str()?.parse().ok()?;
            Some((price, size))
        })
        .collect()
}

#[derive(Deserialize)]
struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<Value>,
    asks: Vec<Value>,
}

#[derive(Deserialize)]
struct DepthDiffFrame {
    data: DepthDiffData,
}

#[derive(Deserialize)]
struct DepthDiffData {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<Value>,
    #[serde(rename = "a")]
    asks: Vec<Value>,
}

#[derive(Deserialize)]
struct AggTradeFrame {
    data: AggTradeData,
}

#[derive(Deserialize)]
struct AggTradeData {
    #[serde(rename = "T")]
    trade_time: u64,
    #[serde(rename = "a")]
    agg_trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Deserialize)]
struct PremiumIndexEntry {
    symbol: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: Decimal,
}

impl ExchangeAdapter for BinancePerpetualAdapter {
    fn name(&self) -> &'static str {
        "binance_perpetual"
    }

    fn rest_base_url(&self) -> &str {
        REST_BASE_URL
    }

    fn ws_url(&self) -> &str {
        WS_URL
    }

    fn order_book_snapshot_url(&self, trading_pair: &str) -> String {
        format!(
            "{REST_BASE_URL}/fapi/v1/depth?symbol={}&limit=1000",
            self.exchange_symbol(trading_pair)
        )
    }

    fn last_traded_price_url(&self, trading_pairs: &[String]) -> String {
        if trading_pairs.len() == 1 {
            format!(
                "{REST_BASE_URL}/fapi/v1/ticker/price?symbol={}",
                self.exchange_symbol(&trading_pairs[0])
            )
        } else {
            format!("{REST_BASE_URL}/fapi/v1/ticker/price")
        }
    }

    fn funding_info_rest_url(&self, _trading_pair: &str) -> String {
        format!("{REST_BASE_URL}/fapi/v1/premiumIndex")
    }

    fn ws_subscribe_payload(&self, trading_pairs: &[String]) -> String {
        let streams: Vec<String> = trading_pairs
            .iter()
            .flat_map(|p| {
                let s = self.exchange_symbol(p).to_lowercase();
                vec![format!("{s}@depth@100ms"), format!("{s}@aggTrade")]
            })
            .collect();
        serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": 1,
        })
        .to_string()
    }

    fn ws_funding_subscribe_payload(&self, _trading_pairs: &[String]) -> Option<String> {
        // `!markPrice@arr` carries every symbol's funding info in one frame,
        // no per-pair subscription needed.
        Some(
            serde_json::json!({
                "method": "SUBSCRIBE",
                "params": ["!markPrice@arr@1s"],
                "id": 2,
            })
            .to_string(),
        )
    }

    fn exchange_symbol(&self, trading_pair: &str) -> String {
        trading_pair.replace('-', "")
    }

    fn trading_pair_from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String> {
        // USDT-margined symbols end in USDT; split the base off the tail.
        let quote = "USDT";
        exchange_symbol
            .strip_suffix(quote)
            .map(|base| format!("{base}-{quote}"))
    }

    fn rate_limits(&self) -> Vec<RateLimit> {
        vec![
            RateLimit::new("REQUEST_WEIGHT", 2400, Duration::from_secs(60)),
            RateLimit::new("ORDERS", 1200, Duration::from_secs(60)),
            RateLimit::new("fapi/v1/depth", 2400, Duration::from_secs(60))
                .with_weight(20)
                .linked("REQUEST_WEIGHT", 20),
            RateLimit::new("fapi/v1/ticker/price", 2400, Duration::from_secs(60))
                .with_weight(2)
                .linked("REQUEST_WEIGHT", 2),
            RateLimit::new("fapi/v1/premiumIndex", 2400, Duration::from_secs(60))
                .with_weight(10)
                .linked("REQUEST_WEIGHT", 10),
        ]
    }

    fn requires_sequence_continuity(&self) -> bool {
        true
    }

    fn health_check_url(&self) -> Option<String> {
        Some(format!("{REST_BASE_URL}/fapi/v1/ping"))
    }

    fn classify_frame(&self, raw: &str) -> Option<FrameKind> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let stream = value.get("stream")?.as_str()?;
        if stream.contains("@depth") {
            Some(FrameKind::Diff)
        } else if stream.contains("@aggTrade") {
            Some(FrameKind::Trade)
        } else if stream.contains("markPrice") {
            Some(FrameKind::Funding)
        } else {
            None
        }
    }

    fn parse_snapshot(&self, trading_pair: &str, payload: &str) -> PipelineResult<OrderBookMessage> {
        let parsed: DepthSnapshot = serde_json::from_str(payload)?;
        Ok(OrderBookMessage::snapshot(
            trading_pair,
            now_unix(),
            parsed.last_update_id,
            levels_from_pairs(&parsed.bids),
            levels_from_pairs(&parsed.asks),
        ))
    }

    fn parse_diff(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let frame: DepthDiffFrame = serde_json::from_str(payload)?;
        let data = frame.data;
        let exchange_symbol = payload_symbol(payload)
            .ok_or_else(|| PipelineError::Parse("depth diff missing symbol".into()))?;
        let trading_pair = self
            .trading_pair_from_exchange_symbol(&exchange_symbol)
            .ok_or_else(|| PipelineError::Parse(format!("unknown symbol {exchange_symbol}")))?;
        Ok(OrderBookMessage::diff(
            trading_pair,
            data.event_time / 1000,
            data.final_update_id,
            Some(data.first_update_id),
            levels_from_pairs(&data.bids),
            levels_from_pairs(&data.asks),
        ))
    }

    fn parse_trade(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let frame: AggTradeFrame = serde_json::from_str(payload)?;
        let data = frame.data;
        let exchange_symbol = payload_symbol(payload)
            .ok_or_else(|| PipelineError::Parse("agg trade missing symbol".into()))?;
        let trading_pair = self
            .trading_pair_from_exchange_symbol(&exchange_symbol)
            .ok_or_else(|| PipelineError::Parse(format!("unknown symbol {exchange_symbol}")))?;
        // Binance's `m` flag is "is the buyer the market maker"; a maker
        // buyer means the aggressor sold.
        let trade_type = if data.is_buyer_maker {
            TradeType::Sell
        } else {
            TradeType::Buy
        };
        Ok(OrderBookMessage::trade(
            trading_pair,
            data.trade_time / 1000,
            data.agg_trade_id.to_string(),
            data.price,
            data.quantity,
            trade_type,
        ))
    }

    fn parse_last_traded_prices(&self, payload: &str) -> PipelineResult<Vec<(String, Decimal)>> {
        #[derive(Deserialize)]
        struct Ticker {
            symbol: String,
            price: Decimal,
        }
        let value: Value = serde_json::from_str(payload)?;
        let tickers: Vec<Ticker> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        Ok(tickers
            .into_iter()
            .filter_map(|t| {
                self.trading_pair_from_exchange_symbol(&t.symbol)
                    .map(|pair| (pair, t.price))
            })
            .collect())
    }

    fn parse_funding_rest(&self, payload: &str) -> PipelineResult<RawFundingInfo> {
        let entry: PremiumIndexEntry = serde_json::from_str(payload)?;
        Ok(RawFundingInfo {
            rate: entry.last_funding_rate,
            // `/fapi/v1/premiumIndex` doesn't report the interval; the
            // caller falls back to the un-normalized rate.
            interval_hours: None,
        })
    }

    fn parse_funding_ws(&self, payload: &str) -> PipelineResult<Vec<(String, RawFundingInfo)>> {
        // Combined-stream frames arrive wrapped as {"stream":..,"data":[..]};
        // accept a bare array too, for callers that already unwrapped it.
        let value: Value = serde_json::from_str(payload)?;
        let entries: Vec<PremiumIndexEntry> = match value.get("data") {
            Some(data) => serde_json::from_value(data.clone())?,
            None => serde_json::from_value(value)?,
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                self.trading_pair_from_exchange_symbol(&entry.symbol)
                    .map(|pair| {
                        (
                            pair,
                            RawFundingInfo {
                                rate: entry.last_funding_rate,
                                interval_hours: None,
                            },
                        )
                    })
            })
            .collect())
    }
}

fn payload_symbol(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .get("data")?
        .get("s")?
        .as_str()
        .map(|s| s.to_string())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_translation_round_trips() {
        let adapter = BinancePerpetualAdapter::new();
        let symbol = adapter.exchange_symbol("BTC-USDT");
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(
            adapter.trading_pair_from_exchange_symbol(&symbol),
            Some("BTC-USDT".to_string())
        );
    }

    #[test]
    fn parses_depth_snapshot() {
        let adapter = BinancePerpetualAdapter::new();
        let payload = r#"{"lastUpdateId": 42, "bids": [["100.5", "1.0"]], "asks": [["101.0", "2.0"]]}"#;
        let msg = adapter.parse_snapshot("BTC-USDT", payload).unwrap();
        assert_eq!(msg.update_id, 42);
        assert_eq!(msg.bids.len(), 1);
    }

    #[test]
    fn requires_sequence_continuity_is_true() {
        assert!(BinancePerpetualAdapter::new().requires_sequence_continuity());
    }

    #[test]
    fn classifies_combined_stream_frames() {
        let adapter = BinancePerpetualAdapter::new();
        assert_eq!(
            adapter.classify_frame(r#"{"stream":"btcusdt@depth@100ms","data":{}}"#),
            Some(FrameKind::Diff)
        );
        assert_eq!(
            adapter.classify_frame(r#"{"stream":"btcusdt@aggTrade","data":{}}"#),
            Some(FrameKind::Trade)
        );
        assert_eq!(
            adapter.classify_frame(r#"{"stream":"!markPrice@arr@1s","data":[]}"#),
            Some(FrameKind::Funding)
        );
        assert_eq!(adapter.classify_frame(r#"{"stream":"unknown","data":{}}"#), None);
    }

    #[test]
    fn parses_funding_ws_wrapped_in_combined_stream_envelope() {
        let adapter = BinancePerpetualAdapter::new();
        let payload = r#"{"stream":"!markPrice@arr@1s","data":[{"symbol":"BTCUSDT","lastFundingRate":"0.0001"}]}"#;
        let entries = adapter.parse_funding_ws(payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "BTC-USDT");
    }

    #[test]
    fn parses_funding_ws_bare_array() {
        let adapter = BinancePerpetualAdapter::new();
        let payload = r#"[{"symbol":"BTCUSDT","lastFundingRate":"0.0001"}]"#;
        let entries = adapter.parse_funding_ws(payload).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
