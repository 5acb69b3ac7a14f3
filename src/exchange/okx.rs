//! OKX v5 public-API adapter.
//!
//! OKX's `books`/`trades`/`funding-rate` channels carry no `U`/`u`-style
//! sequence pair, so `requires_sequence_continuity()` is `false` — the
//! tracker falls back to the plain `update_id` monotonicity check.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::{ExchangeAdapter, FrameKind, RawFundingInfo};
use crate::error::{PipelineError, PipelineResult};
use crate::order_book::{Level, OrderBookMessage, TradeType};
use crate::rate_limiter::RateLimit;

const REST_BASE_URL: &str = "https://www.okx.com";
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub struct OkxAdapter;

impl OkxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OkxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn levels_from_pairs(raw: &[Value]) -> Vec<Level> {
    raw.iter()
        .filter_map(|entry| {
            let fields = entry.as_array()?;
            let price: Decimal = fields.first()?.as_str()?.parse().ok()?;
            let size: Decimal = fields.get(1)?.as_str()?.parse().ok()?;
            Some((price, size))
        })
        .collect()
}

#[derive(Deserialize)]
struct BooksFrame {
    arg: ChannelArg,
    data: Vec<BooksData>,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Deserialize)]
struct ChannelArg {
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Deserialize)]
struct BooksData {
    bids: Vec<Value>,
    asks: Vec<Value>,
    #[serde(rename = "ts")]
    timestamp: String,
    #[serde(rename = "seqId")]
    seq_id: u64,
}

#[derive(Deserialize)]
struct TradesFrame {
    arg: ChannelArg,
    data: Vec<TradesData>,
}

#[derive(Deserialize)]
struct TradesData {
    #[serde(rename = "tradeId")]
    trade_id: String,
    px: Decimal,
    sz: Decimal,
    side: String,
    ts: String,
}

#[derive(Deserialize)]
struct FundingRateFrame {
    data: Vec<FundingRateData>,
}

#[derive(Deserialize)]
struct FundingRateData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
}

#[derive(Deserialize)]
struct TickerEntry {
    #[serde(rename = "instId")]
    inst_id: String,
    last: Decimal,
}

impl ExchangeAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "okx"
    }

    fn rest_base_url(&self) -> &str {
        REST_BASE_URL
    }

    fn ws_url(&self) -> &str {
        WS_URL
    }

    fn order_book_snapshot_url(&self, trading_pair: &str) -> String {
        format!(
            "{REST_BASE_URL}/api/v5/market/books?instId={}&sz=400",
            self.exchange_symbol(trading_pair)
        )
    }

    fn last_traded_price_url(&self, trading_pairs: &[String]) -> String {
        if trading_pairs.len() == 1 {
            format!(
                "{REST_BASE_URL}/api/v5/market/ticker?instId={}",
                self.exchange_symbol(&trading_pairs[0])
            )
        } else {
            format!("{REST_BASE_URL}/api/v5/market/tickers?instType=SWAP")
        }
    }

    fn funding_info_rest_url(&self, trading_pair: &str) -> String {
        format!(
            "{REST_BASE_URL}/api/v5/public/funding-rate?instId={}",
            self.exchange_symbol(trading_pair)
        )
    }

    fn ws_subscribe_payload(&self, trading_pairs: &[String]) -> String {
        let args: Vec<Value> = trading_pairs
            .iter()
            .flat_map(|p| {
                let inst_id = self.exchange_symbol(p);
                vec![
                    serde_json::json!({"channel": "books", "instId": inst_id}),
                    serde_json::json!({"channel": "trades", "instId": inst_id}),
                ]
            })
            .collect();
        serde_json::json!({"op": "subscribe", "args": args}).to_string()
    }

    fn ws_funding_subscribe_payload(&self, trading_pairs: &[String]) -> Option<String> {
        let args: Vec<Value> = trading_pairs
            .iter()
            .map(|p| serde_json::json!({"channel": "funding-rate", "instId": self.exchange_symbol(p)}))
            .collect();
        Some(serde_json::json!({"op": "subscribe", "args": args}).to_string())
    }

    fn exchange_symbol(&self, trading_pair: &str) -> String {
        format!("{trading_pair}-SWAP")
    }

    fn trading_pair_from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String> {
        exchange_symbol.strip_suffix("-SWAP").map(|s| s.to_string())
    }

    fn rate_limits(&self) -> Vec<RateLimit> {
        vec![
            RateLimit::new("api/v5/market/books", 40, Duration::from_secs(2)),
            RateLimit::new("api/v5/market/ticker", 20, Duration::from_secs(2)),
            RateLimit::new("api/v5/public/funding-rate", 20, Duration::from_secs(2)),
        ]
    }

    fn requires_sequence_continuity(&self) -> bool {
        false
    }

    fn health_check_url(&self) -> Option<String> {
        Some(format!("{REST_BASE_URL}/api/v5/public/time"))
    }

    fn classify_frame(&self, raw: &str) -> Option<FrameKind> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let channel = value.get("arg")?.get("channel")?.as_str()?;
        match channel {
            "books" => {
                if value.get("action").and_then(|a| a.as_str()) == Some("snapshot") {
                    Some(FrameKind::Snapshot)
                } else {
                    Some(FrameKind::Diff)
                }
            }
            "trades" => Some(FrameKind::Trade),
            "funding-rate" => Some(FrameKind::Funding),
            _ => None,
        }
    }

    fn parse_snapshot(&self, trading_pair: &str, payload: &str) -> PipelineResult<OrderBookMessage> {
        let frame: BooksFrame = serde_json::from_str(payload)?;
        let data = frame
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Parse("empty books snapshot".into()))?;
        Ok(OrderBookMessage::snapshot(
            trading_pair,
            data.timestamp.parse::<u64>().unwrap_or(0) / 1000,
            data.seq_id,
            levels_from_pairs(&data.bids),
            levels_from_pairs(&data.asks),
        ))
    }

    fn parse_diff(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let frame: BooksFrame = serde_json::from_str(payload)?;
        let trading_pair = self
            .trading_pair_from_exchange_symbol(&frame.arg.inst_id)
            .ok_or_else(|| PipelineError::Parse(format!("unknown symbol {}", frame.arg.inst_id)))?;
        let data = frame
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Parse("empty books update".into()))?;
        if frame.action.as_deref() == Some("snapshot") {
            return Ok(OrderBookMessage::snapshot(
                trading_pair,
                data.timestamp.parse::<u64>().unwrap_or(0) / 1000,
                data.seq_id,
                levels_from_pairs(&data.bids),
                levels_from_pairs(&data.asks),
            ));
        }
        Ok(OrderBookMessage::diff(
            trading_pair,
            data.timestamp.parse::<u64>().unwrap_or(0) / 1000,
            data.seq_id,
            None,
            levels_from_pairs(&data.bids),
            levels_from_pairs(&data.asks),
        ))
    }

    fn parse_trade(&self, payload: &str) -> PipelineResult<OrderBookMessage> {
        let frame: TradesFrame = serde_json::from_str(payload)?;
        let trading_pair = self
            .trading_pair_from_exchange_symbol(&frame.arg.inst_id)
            .ok_or_else(|| PipelineError::Parse(format!("unknown symbol {}", frame.arg.inst_id)))?;
        let data = frame
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Parse("empty trades frame".into()))?;
        let trade_type = if data.side == "buy" {
            TradeType::Buy
        } else {
            TradeType::Sell
        };
        Ok(OrderBookMessage::trade(
            trading_pair,
            data.ts.parse::<u64>().unwrap_or(0) / 1000,
            data.trade_id,
            data.px,
            data.sz,
            trade_type,
        ))
    }

    fn parse_last_traded_prices(&self, payload: &str) -> PipelineResult<Vec<(String, Decimal)>> {
        #[derive(Deserialize)]
        struct TickerEnvelope {
            data: Vec<TickerEntry>,
        }
        let envelope: TickerEnvelope = serde_json::from_str(payload)?;
        Ok(envelope
            .data
            .into_iter()
            .filter_map(|t| {
                self.trading_pair_from_exchange_symbol(&t.inst_id)
                    .map(|pair| (pair, t.last))
            })
            .collect())
    }

    fn parse_funding_rest(&self, payload: &str) -> PipelineResult<RawFundingInfo> {
        #[derive(Deserialize)]
        struct Envelope {
            data: Vec<FundingRateData>,
        }
        let envelope: Envelope = serde_json::from_str(payload)?;
        let entry = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Parse("empty funding-rate response".into()))?;
        Ok(RawFundingInfo {
            rate: entry.funding_rate,
            // OKX's settlement cadence varies by instrument and isn't
            // carried in this endpoint; fall back to un-normalized.
            interval_hours: None,
        })
    }

    fn parse_funding_ws(&self, payload: &str) -> PipelineResult<Vec<(String, RawFundingInfo)>> {
        let frame: FundingRateFrame = serde_json::from_str(payload)?;
        Ok(frame
            .data
            .into_iter()
            .filter_map(|entry| {
                self.trading_pair_from_exchange_symbol(&entry.inst_id)
                    .map(|pair| {
                        (
                            pair,
                            RawFundingInfo {
                                rate: entry.funding_rate,
                                interval_hours: None,
                            },
                        )
                    })
            })
            .collect())
    }
}
