//! Closed-candle fan-out to streaming subscribers.
//!
//! The registry maps symbols to subscriber queues. `publish` takes the read
//! side and uses non-blocking sends: a subscriber that stops draining loses
//! candles instead of stalling the pipeline or its peers. `subscribe` and
//! `unsubscribe` take the write side. The lock is never held across
//! anything that can wait -- `try_send` either enqueues or fails
//! immediately.

use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::metrics::FanoutMetrics;
use crate::types::{Ohlc, Symbol};

/// Subscriber registry plus drop-on-slow-consumer delivery.
pub struct Broker {
    subscribers: RwLock<HashMap<Symbol, Vec<mpsc::Sender<Ohlc>>>>,
    max_subscribers: usize,
    metrics: Arc<FanoutMetrics>,
}

impl Broker {
    #[must_use]
    pub fn new(max_subscribers: usize, metrics: Arc<FanoutMetrics>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            max_subscribers,
            metrics,
        }
    }

    /// Register `queue` for `symbol`. The same queue may be registered for
    /// several symbols, or several times for one -- entries are distinct.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExceeded`] when the registry already holds
    /// `max_subscribers` entries.
    pub fn subscribe(&self, symbol: Symbol, queue: mpsc::Sender<Ohlc>) -> Result<(), Error> {
        let mut subs = self.subscribers.write().expect("registry lock poisoned");
        let active: usize = subs.values().map(Vec::len).sum();
        if active >= self.max_subscribers {
            return Err(Error::CapacityExceeded {
                max: self.max_subscribers,
            });
        }
        subs.entry(symbol).or_default().push(queue);
        self.metrics
            .active_subscriptions
            .store(active as u64 + 1, Relaxed);
        Ok(())
    }

    /// Remove the first entry for `symbol` whose queue is `queue` (identity
    /// comparison, not value).
    pub fn unsubscribe(&self, symbol: &Symbol, queue: &mpsc::Sender<Ohlc>) {
        let mut subs = self.subscribers.write().expect("registry lock poisoned");
        if let Some(list) = subs.get_mut(symbol) {
            if let Some(idx) = list.iter().position(|s| s.same_channel(queue)) {
                list.remove(idx);
            }
            if list.is_empty() {
                subs.remove(symbol);
            }
        }
        let active: usize = subs.values().map(Vec::len).sum();
        self.metrics
            .active_subscriptions
            .store(active as u64, Relaxed);
    }

    /// Deliver `ohlc` to every subscriber registered for its symbol.
    /// Non-blocking: a full queue drops this candle for that subscriber
    /// only. Never fails for the caller.
    pub fn publish(&self, ohlc: &Ohlc) {
        self.metrics.published.fetch_add(1, Relaxed);

        let subs = self.subscribers.read().expect("registry lock poisoned");
        let Some(list) = subs.get(&ohlc.symbol) else {
            return;
        };

        for queue in list {
            match queue.try_send(ohlc.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.subscriber_drops.fetch_add(1, Relaxed);
                    warn!(
                        symbol = %ohlc.symbol,
                        open_time = ohlc.open_time,
                        "subscriber queue full, dropping candle"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver already gone; its guard will unsubscribe.
                    debug!(symbol = %ohlc.symbol, "subscriber queue closed");
                }
            }
        }
    }

    /// Current number of registry entries.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::testutil::ohlc;

    fn broker(max: usize) -> Broker {
        Broker::new(max, Metrics::register().fanout())
    }

    #[test]
    fn publish_reaches_every_subscriber_in_order() {
        let b = broker(10);
        let sym = Symbol::from("ETHUSDT");
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        b.subscribe(sym.clone(), tx_a).unwrap();
        b.subscribe(sym.clone(), tx_b).unwrap();

        for open_time in [0, 60_000, 120_000] {
            b.publish(&ohlc("ETHUSDT", open_time, 60_000));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let opens: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
                .map(|c| c.open_time)
                .collect();
            assert_eq!(opens, vec![0, 60_000, 120_000]);
        }
    }

    #[test]
    fn slow_subscriber_loses_candles_without_stalling_peers() {
        // Scenario: queue size 1 each; B never drains.
        let b = broker(10);
        let sym = Symbol::from("ETHUSDT");
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);
        b.subscribe(sym.clone(), tx_a).unwrap();
        b.subscribe(sym.clone(), tx_b).unwrap();

        // A drains between publishes; B does not.
        let mut seen_a = Vec::new();
        for open_time in [0, 60_000, 120_000] {
            b.publish(&ohlc("ETHUSDT", open_time, 60_000));
            seen_a.push(rx_a.try_recv().expect("A keeps up").open_time);
        }

        assert_eq!(seen_a, vec![0, 60_000, 120_000]);
        // B got exactly the first candle; the rest were dropped.
        assert_eq!(rx_b.try_recv().unwrap().open_time, 0);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_registry_unchanged() {
        let b = broker(10);
        let sym = Symbol::from("BTCUSDT");
        let (tx, _rx) = mpsc::channel(1);

        assert_eq!(b.subscription_count(), 0);
        b.subscribe(sym.clone(), tx.clone()).unwrap();
        assert_eq!(b.subscription_count(), 1);
        b.unsubscribe(&sym, &tx);
        assert_eq!(b.subscription_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_the_matching_queue() {
        let b = broker(10);
        let sym = Symbol::from("BTCUSDT");
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        b.subscribe(sym.clone(), tx_a.clone()).unwrap();
        b.subscribe(sym.clone(), tx_b).unwrap();

        b.unsubscribe(&sym, &tx_a);
        b.publish(&ohlc("BTCUSDT", 0, 60_000));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn capacity_cap_rejects_further_subscriptions() {
        let b = broker(2);
        let (tx, _rx) = mpsc::channel(1);

        b.subscribe(Symbol::from("BTCUSDT"), tx.clone()).unwrap();
        b.subscribe(Symbol::from("ETHUSDT"), tx.clone()).unwrap();

        let err = b.subscribe(Symbol::from("PEPEUSDT"), tx.clone()).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 2 }));

        // Freeing a slot lets the next subscriber in.
        b.unsubscribe(&Symbol::from("BTCUSDT"), &tx);
        b.subscribe(Symbol::from("PEPEUSDT"), tx).unwrap();
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let b = broker(10);
        b.publish(&ohlc("BTCUSDT", 0, 60_000));
    }

    #[test]
    fn duplicate_registration_delivers_twice() {
        let b = broker(10);
        let sym = Symbol::from("BTCUSDT");
        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(sym.clone(), tx.clone()).unwrap();
        b.subscribe(sym, tx).unwrap();

        b.publish(&ohlc("BTCUSDT", 0, 60_000));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
