//! Typed pub/sub for strategy-facing lifecycle events.
//!
//! The original's listener registry (`examples/original_source/hummingbot/
//! core/event/event_forwarder.py`) holds weak references so a listener that
//! drops out of scope is forgotten without an explicit unsubscribe. Rust has
//! no GC to make that safe, so this carries an explicit cancellation token
//! instead: `subscribe()` returns both a
//! receiver and a `SubscriptionHandle` whose `Drop` removes the listener.
//! Delivery fans out synchronously to every live subscriber on `publish`,
//! matching `EventForwarder`'s direct-call dispatch rather than the
//! original's separate forwarder-per-listener indirection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::order_book::TradeType;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    OrderBookTrade {
        trading_pair: String,
        price: Decimal,
        amount: Decimal,
        trade_type: TradeType,
    },
    OrderBookDiffApplied {
        trading_pair: String,
        update_id: u64,
    },
    FundingRateUpdated {
        trading_pair: String,
        rate: Decimal,
    },
    ExecutorStarted,
    ExecutorStopped,
}

type Registry = Mutex<HashMap<u64, mpsc::UnboundedSender<PipelineEvent>>>;

/// Dropping this unsubscribes; the caller owns the handle's lifetime. A
/// leaked handle (e.g. `std::mem::forget`) leaves the subscription alive
/// forever, same tradeoff as an un-dropped guard anywhere else.
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}

pub struct EventHub {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> (mpsc::UnboundedReceiver<PipelineEvent>, SubscriptionHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(id, tx);
        (
            rx,
            SubscriptionHandle {
                id,
                registry: Arc::downgrade(&self.subscribers),
            },
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Fans `event` out to every live subscriber; a subscriber whose
    /// receiver was dropped without unsubscribing is silently skipped
    /// (`send` returning an error there is not this hub's problem).
    pub fn publish(&self, event: PipelineEvent) {
        let subscribers = self.subscribers.lock();
        for sender in subscribers.values() {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = EventHub::new();
        let (mut rx, _handle) = hub.subscribe();
        hub.publish(PipelineEvent::FundingRateUpdated {
            trading_pair: "BTC-USDT".to_string(),
            rate: dec!(0.0001),
        });
        let event = rx.recv().await.unwrap();
        match event {
            PipelineEvent::FundingRateUpdated { trading_pair, .. } => {
                assert_eq!(trading_pair, "BTC-USDT");
            }
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let hub = EventHub::new();
        let (_rx, handle) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(handle);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
