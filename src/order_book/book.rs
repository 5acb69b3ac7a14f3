//! Per-symbol order book ladder.
//!
//! The ladder itself generalizes `backtest_v2::book::OrderBook`'s
//! `BTreeMap`-per-side design (ordered access, `size <= 0` removes a
//! level), swapped from `f64` to `rust_decimal::Decimal` since prices and
//! sizes need arbitrary-precision arithmetic. Point-in-time reads are lock-free,
//! generalized from `scrapers::polymarket_book_store::BookSnapshot`'s
//! `ArcSwap<BookSnapshot>` pattern: every mutation builds a new immutable
//! `BookState` and swaps it in, so a reader never observes a torn ladder.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::message::{Level, OrderBookMessage};

#[derive(Debug, Clone, Default)]
struct BookState {
    // Keyed by `Reverse<Decimal>` so ascending BTreeMap order is
    // descending price order — best bid first.
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    // Ascending price order — best ask first.
    asks: BTreeMap<Decimal, Decimal>,
    snapshot_uid: u64,
    last_diff_uid: u64,
}

impl BookState {
    fn from_levels(bids: &[Level], asks: &[Level], update_id: u64) -> Self {
        let mut state = BookState {
            snapshot_uid: update_id,
            last_diff_uid: update_id,
            ..Default::default()
        };
        for &(price, size) in bids {
            upsert_bid(&mut state.bids, price, size);
        }
        for &(price, size) in asks {
            upsert_ask(&mut state.asks, price, size);
        }
        state
    }
}

fn upsert_bid(map: &mut BTreeMap<Reverse<Decimal>, Decimal>, price: Decimal, size: Decimal) {
    if size.is_sign_negative() || size.is_zero() {
        map.remove(&Reverse(price));
    } else {
        map.insert(Reverse(price), size);
    }
}

fn upsert_ask(map: &mut BTreeMap<Decimal, Decimal>, price: Decimal, size: Decimal) {
    if size.is_sign_negative() || size.is_zero() {
        map.remove(&price);
    } else {
        map.insert(price, size);
    }
}

/// In-memory bid/ask ladder for one trading pair, with a monotonic
/// update-id discipline: diffs are only applied in strictly increasing
/// update-id order.
pub struct OrderBook {
    pub trading_pair: String,
    state: ArcSwap<BookState>,
    last_trade_price: Mutex<Option<Decimal>>,
    last_applied_trade: Mutex<Option<Instant>>,
    last_trade_price_rest_updated: Mutex<Option<Instant>>,
}

impl OrderBook {
    pub fn new(trading_pair: impl Into<String>) -> Self {
        Self {
            trading_pair: trading_pair.into(),
            state: ArcSwap::from_pointee(BookState::default()),
            last_trade_price: Mutex::new(None),
            last_applied_trade: Mutex::new(None),
            last_trade_price_rest_updated: Mutex::new(None),
        }
    }

    pub fn snapshot_uid(&self) -> u64 {
        self.state.load().snapshot_uid
    }

    pub fn last_diff_uid(&self) -> u64 {
        self.state.load().last_diff_uid
    }

    /// Upserts each level from a diff (size 0 removes). Requires
    /// `update_id > last_diff_uid`; diffs that fail the precondition are
    /// dropped silently and `false` is returned.
    pub fn apply_diffs(&self, bids: &[Level], asks: &[Level], update_id: u64) -> bool {
        let current = self.state.load();
        if update_id <= current.last_diff_uid {
            return false;
        }
        let mut next = (**current).clone();
        for &(price, size) in bids {
            upsert_bid(&mut next.bids, price, size);
        }
        for &(price, size) in asks {
            upsert_ask(&mut next.asks, price, size);
        }
        next.last_diff_uid = update_id;
        self.state.store(Arc::new(next));
        true
    }

    /// Replaces both ladders with the snapshot's levels, sets
    /// `snapshot_uid = last_diff_uid = snapshot.update_id`, then re-applies
    /// every diff in `past_diffs` whose `update_id > snapshot.update_id` in
    /// ascending id order.
    pub fn restore_from_snapshot_and_diffs(
        &self,
        snapshot: &OrderBookMessage,
        past_diffs: &[OrderBookMessage],
    ) {
        let fresh = BookState::from_levels(&snapshot.bids, &snapshot.asks, snapshot.update_id);
        self.state.store(Arc::new(fresh));

        let mut replay: Vec<&OrderBookMessage> = past_diffs
            .iter()
            .filter(|d| d.update_id > snapshot.update_id)
            .collect();
        replay.sort_by_key(|d| d.update_id);
        for diff in replay {
            self.apply_diffs(&diff.bids, &diff.asks, diff.update_id);
        }
    }

    pub fn apply_trade(&self, price: Decimal, applied_at: Instant) {
        *self.last_trade_price.lock() = Some(price);
        *self.last_applied_trade.lock() = Some(applied_at);
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        *self.last_trade_price.lock()
    }

    pub fn last_applied_trade(&self) -> Option<Instant> {
        *self.last_applied_trade.lock()
    }

    pub fn last_trade_price_rest_updated(&self) -> Option<Instant> {
        *self.last_trade_price_rest_updated.lock()
    }

    pub fn set_last_trade_price_from_rest(&self, price: Decimal, at: Instant) {
        *self.last_trade_price.lock() = Some(price);
        *self.last_trade_price_rest_updated.lock() = Some(at);
    }

    /// Consistent point-in-time view: bids descending, asks ascending.
    pub fn snapshot(&self) -> (Vec<Level>, Vec<Level>) {
        let state = self.state.load();
        let bids = state.bids.iter().map(|(Reverse(p), s)| (*p, *s)).collect();
        let asks = state.asks.iter().map(|(p, s)| (*p, *s)).collect();
        (bids, asks)
    }

    pub fn best_bid(&self) -> Option<Level> {
        let state = self.state.load();
        state.bids.iter().next().map(|(Reverse(p), s)| (*p, *s))
    }

    pub fn best_ask(&self) -> Option<Level> {
        let state = self.state.load();
        state.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    /// Discards all ladder state, used when a sequence gap forces
    /// reinitialization.
    pub fn reset(&self) {
        self.state.store(Arc::new(BookState::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn msg_snapshot(update_id: u64, bids: Vec<Level>, asks: Vec<Level>) -> OrderBookMessage {
        OrderBookMessage::snapshot("BTC-USDT", 0, update_id, bids, asks)
    }

    fn msg_diff(update_id: u64, bids: Vec<Level>, asks: Vec<Level>) -> OrderBookMessage {
        OrderBookMessage::diff("BTC-USDT", 0, update_id, None, bids, asks)
    }

    #[test]
    fn apply_diffs_requires_strictly_increasing_update_id() {
        let book = OrderBook::new("BTC-USDT");
        assert!(book.apply_diffs(&[(dec!(100), dec!(1))], &[], 10));
        assert_eq!(book.last_diff_uid(), 10);
        // Same id again: dropped.
        assert!(!book.apply_diffs(&[(dec!(100), dec!(2))], &[], 10));
        assert_eq!(book.last_diff_uid(), 10);
        // Lower id: dropped.
        assert!(!book.apply_diffs(&[(dec!(100), dec!(2))], &[], 5));
        // Higher id: applied.
        assert!(book.apply_diffs(&[(dec!(100), dec!(2))], &[], 11));
        assert_eq!(book.last_diff_uid(), 11);
    }

    #[test]
    fn zero_size_removes_level() {
        let book = OrderBook::new("BTC-USDT");
        book.apply_diffs(&[(dec!(100), dec!(1))], &[], 1);
        assert_eq!(book.best_bid(), Some((dec!(100), dec!(1))));
        book.apply_diffs(&[(dec!(100), dec!(0))], &[], 2);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn restore_from_snapshot_sets_uids_and_replays_newer_diffs() {
        // Diffs buffered while a REST snapshot was still in flight replay
        // on top of it once the snapshot lands.
        let book = OrderBook::new("BTC-USDT");
        let past_diffs = vec![msg_diff(11, vec![(dec!(99), dec!(1))], vec![]), msg_diff(12, vec![(dec!(98), dec!(2))], vec![])];
        let snapshot = msg_snapshot(11, vec![(dec!(100), dec!(1))], vec![(dec!(101), dec!(1))]);

        book.restore_from_snapshot_and_diffs(&snapshot, &past_diffs);

        assert_eq!(book.snapshot_uid(), 11);
        assert_eq!(book.last_diff_uid(), 12);
        let (bids, _asks) = book.snapshot();
        // diff 11 (== snapshot update_id) is filtered out, diff 12 applied.
        assert!(bids.iter().any(|&(p, _)| p == dec!(98)));
        assert!(bids.iter().any(|&(p, _)| p == dec!(100)));
        assert!(!bids.iter().any(|&(p, _)| p == dec!(99)));
    }

    #[test]
    fn applying_same_snapshot_twice_is_idempotent() {
        let book = OrderBook::new("BTC-USDT");
        let snapshot = msg_snapshot(5, vec![(dec!(100), dec!(1))], vec![(dec!(101), dec!(1))]);
        book.restore_from_snapshot_and_diffs(&snapshot, &[]);
        let first = book.snapshot();
        book.restore_from_snapshot_and_diffs(&snapshot, &[]);
        let second = book.snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn best_bid_is_below_best_ask_after_normal_updates() {
        let book = OrderBook::new("BTC-USDT");
        book.apply_diffs(&[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))], 1);
        let (bid, _) = book.best_bid().unwrap();
        let (ask, _) = book.best_ask().unwrap();
        assert!(bid < ask);
    }
}
