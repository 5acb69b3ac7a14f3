//! The wire-neutral message type every exchange adapter parses into.
//!
//! Mirrors Hummingbot's `OrderBookMessage`/`OrderBookMessageType`
//! (`examples/original_source/hummingbot/core/data_type/common.py` for
//! `TradeType`), flattened into one tagged struct instead of a
//! class-per-kind hierarchy.

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeType {
    Buy,
    Sell,
}

/// A single price level: `(price, size)`. A `size` of zero means "remove
/// this level" when applied as part of a diff.
pub type Level = (Decimal, Decimal);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderBookMessageKind {
    Snapshot,
    Diff,
    Trade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeContent {
    pub price: Decimal,
    pub amount: Decimal,
    pub trade_type: TradeType,
    pub trade_id: String,
}

/// Immutable record produced by an `ExchangeAdapter` parser and consumed by
/// the order book tracker. Snapshots always carry the full book state as of
/// `update_id`; diffs carry absolute levels (size 0 = remove); trades carry
/// a single execution in `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookMessage {
    pub kind: OrderBookMessageKind,
    pub trading_pair: String,
    /// Unix-epoch seconds, matching the original's `time.time()` timestamps.
    pub timestamp: u64,
    pub update_id: u64,
    /// Present on diffs from exchanges that publish a `U`/`u` pair
    /// (Binance USDT-M futures); used for the optional sequence-continuity
    /// check (`ExchangeAdapter::requires_sequence_continuity`).
    pub first_update_id: Option<u64>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub content: Option<TradeContent>,
}

impl OrderBookMessage {
    pub fn snapshot(trading_pair: impl Into<String>, timestamp: u64, update_id: u64, bids: Vec<Level>, asks: Vec<Level>) -> Self {
        Self {
            kind: OrderBookMessageKind::Snapshot,
            trading_pair: trading_pair.into(),
            timestamp,
            update_id,
            first_update_id: None,
            bids,
            asks,
            content: None,
        }
    }

    pub fn diff(
        trading_pair: impl Into<String>,
        timestamp: u64,
        update_id: u64,
        first_update_id: Option<u64>,
        bids: Vec<Level>,
        asks: Vec<Level>,
    ) -> Self {
        Self {
            kind: OrderBookMessageKind::Diff,
            trading_pair: trading_pair.into(),
            timestamp,
            update_id,
            first_update_id,
            bids,
            asks,
            content: None,
        }
    }

    pub fn trade(
        trading_pair: impl Into<String>,
        timestamp: u64,
        trade_id: impl Into<String>,
        price: Decimal,
        amount: Decimal,
        trade_type: TradeType,
    ) -> Self {
        Self {
            kind: OrderBookMessageKind::Trade,
            trading_pair: trading_pair.into(),
            timestamp,
            update_id: 0,
            first_update_id: None,
            bids: Vec::new(),
            asks: Vec::new(),
            content: Some(TradeContent {
                price,
                amount,
                trade_type,
                trade_id: trade_id.into(),
            }),
        }
    }
}
