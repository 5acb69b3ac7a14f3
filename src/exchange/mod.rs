//! Exchange plugin boundary.
//!
//! One trait per exchange-specific concern (parsing, URLs, frame
//! classification) carved out of a per-exchange subclass-override shape
//! into a single trait object seam: `ExchangeAdapter` is where every
//! exchange-specific detail crosses, so `tracker`/`funding`/
//! `web_assistant`/`source` stay exchange-agnostic.

mod binance;
mod mock;
mod okx;

pub use binance::BinancePerpetualAdapter;
pub use mock::MockExchangeAdapter;
pub use okx::OkxAdapter;

use rust_decimal::Decimal;

use crate::error::PipelineResult;
use crate::order_book::OrderBookMessage;
use crate::rate_limiter::RateLimit;

/// Raw funding info as reported by one source frame, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFundingInfo {
    pub rate: Decimal,
    /// Hours between funding settlements, when the exchange reports it.
    /// `None` means "unknown" — normalization falls back to caching the
    /// raw rate as-is.
    pub interval_hours: Option<i64>,
}

/// Which channel-keyed queue an inbound WS frame belongs to. Classification
/// is a cheap top-level field inspection — no full parse — so the market
/// data source can route a frame before deciding whether it even needs the
/// fuller per-kind parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Snapshot,
    Diff,
    Trade,
    Funding,
}

/// Everything a plugin must supply for its exchange. Parsers are pure
/// functions from raw wire payloads to the neutral message/info types;
/// network I/O lives in `web_assistant`, not here.
pub trait ExchangeAdapter: Send + Sync {
    /// Stable identifier used in tracing fields and rate-limit bookkeeping.
    fn name(&self) -> &'static str;

    fn rest_base_url(&self) -> &str;
    fn ws_url(&self) -> &str;

    fn order_book_snapshot_url(&self, trading_pair: &str) -> String;
    fn last_traded_price_url(&self, trading_pairs: &[String]) -> String;
    fn funding_info_rest_url(&self, trading_pair: &str) -> String;

    /// WS subscribe frame for order book diffs + trades for these pairs.
    fn ws_subscribe_payload(&self, trading_pairs: &[String]) -> String;
    /// WS subscribe frame for funding-rate push updates, if the exchange
    /// offers one (`None` means funding is REST-poll only).
    fn ws_funding_subscribe_payload(&self, trading_pairs: &[String]) -> Option<String>;

    fn exchange_symbol(&self, trading_pair: &str) -> String;
    fn trading_pair_from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String>;

    fn rate_limits(&self) -> Vec<RateLimit>;

    /// Binance USDT-M futures publishes `U`/`u` first/last update ids and
    /// expects strict continuity between consecutive diffs; OKX's public
    /// channel does not.
    fn requires_sequence_continuity(&self) -> bool {
        false
    }

    /// Lightweight REST probe for periodic connectivity checks.
    /// `None` opts the adapter out of health checking.
    fn health_check_url(&self) -> Option<String> {
        None
    }

    /// Classifies a raw inbound WS frame by channel without fully parsing
    /// it; `None` means the frame matched no known channel and should be
    /// dropped. Used by the market data source to route frames into
    /// per-channel queues ahead of their actual parse.
    fn classify_frame(&self, raw: &str) -> Option<FrameKind>;

    fn parse_snapshot(&self, trading_pair: &str, payload: &str) -> PipelineResult<OrderBookMessage>;
    fn parse_diff(&self, payload: &str) -> PipelineResult<OrderBookMessage>;
    fn parse_trade(&self, payload: &str) -> PipelineResult<OrderBookMessage>;

    /// REST response for `last_traded_price_url`: `{trading_pair: price}`.
    fn parse_last_traded_prices(&self, payload: &str) -> PipelineResult<Vec<(String, Decimal)>>;

    fn parse_funding_rest(&self, payload: &str) -> PipelineResult<RawFundingInfo>;
    /// Push-channel funding frame: zero or more `(trading_pair, info)` pairs
    /// (Binance's `!markPrice@arr` carries every symbol in one frame).
    fn parse_funding_ws(&self, payload: &str) -> PipelineResult<Vec<(String, RawFundingInfo)>>;
}
