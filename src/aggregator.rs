//! Per-symbol OHLC aggregation over wall-clock windows.
//!
//! One open candle per symbol. A tick at or past the current window's close
//! boundary freezes the candle (it is returned to the caller) and opens the
//! next window at the tick's truncated timestamp. Windows are half-open
//! `[open_time, open_time + interval)` on a grid aligned to the Unix epoch;
//! windows with no trades are never synthesized, and a window only closes
//! when a later tick arrives -- there is no time-based flush.
//!
//! The raw tick is persisted before it touches aggregation state. A store
//! failure drops the tick entirely, so the durable tick log and the candle
//! stream never disagree about which trades were seen.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::sink::Sink;
use crate::types::{Ohlc, Symbol, Tick};

/// Floor `ts` to the window grid. Euclidean division keeps pre-epoch
/// timestamps on the same grid.
pub(crate) fn truncate_ms(ts: i64, interval_ms: i64) -> i64 {
    ts.div_euclid(interval_ms) * interval_ms
}

/// Folds ticks into fixed-interval candles, one open window per symbol.
///
/// The pipeline's single tick-consumer task is the only writer; the map
/// lock exists so `current` can take defensive snapshots from other tasks,
/// not to arbitrate concurrent writers. The lock is never held across any
/// I/O.
pub struct Aggregator {
    current: RwLock<HashMap<Symbol, Ohlc>>,
    interval_ms: i64,
    sink: Arc<dyn Sink>,
}

impl Aggregator {
    /// # Panics
    ///
    /// When `interval` rounds to zero milliseconds -- the window grid would
    /// be degenerate. This is a configuration error, not a runtime path.
    #[must_use]
    pub fn new(interval: Duration, sink: Arc<dyn Sink>) -> Self {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(0);
        assert!(interval_ms > 0, "aggregation interval must be positive");
        Self {
            current: RwLock::new(HashMap::new()),
            interval_ms,
            sink,
        }
    }

    /// Window length in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Fold one tick. Returns the finished candle when this tick rolled the
    /// window over; errors only when the raw tick could not be persisted, in
    /// which case the tick is dropped from aggregation entirely.
    ///
    /// An out-of-order tick older than the open window folds into the
    /// current window as if it had arrived in order; previous windows are
    /// never reopened.
    pub fn process(&self, tick: &Tick) -> Result<Option<Ohlc>, StoreError> {
        // Persist first, outside the map lock.
        self.sink.store_tick(tick)?;

        let mut current = self.current.write().expect("aggregator lock poisoned");
        let closed = match current.get_mut(&tick.symbol) {
            Some(candle) if tick.timestamp >= candle.close_time => {
                let next = self.open_window(tick);
                Some(std::mem::replace(candle, next))
            }
            Some(candle) => {
                candle.extend(tick);
                None
            }
            None => {
                current.insert(tick.symbol.clone(), self.open_window(tick));
                None
            }
        };
        drop(current);

        if let Some(candle) = &closed {
            debug!(
                symbol = %candle.symbol,
                open_time = candle.open_time,
                close = candle.close,
                volume = candle.volume,
                "window closed"
            );
        }
        Ok(closed)
    }

    /// Defensive copy of the open candle for `symbol`, if any. Diagnostics
    /// only -- the returned value is detached from aggregation state.
    #[must_use]
    pub fn current(&self, symbol: &Symbol) -> Option<Ohlc> {
        self.current
            .read()
            .expect("aggregator lock poisoned")
            .get(symbol)
            .cloned()
    }

    fn open_window(&self, tick: &Tick) -> Ohlc {
        let open_time = truncate_ms(tick.timestamp, self.interval_ms);
        Ohlc::open_at(tick, open_time, self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tick, MemorySink};

    const MINUTE: i64 = 60_000;

    fn minute_aggregator() -> (Aggregator, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let agg = Aggregator::new(Duration::from_secs(60), sink.clone());
        (agg, sink)
    }

    #[test]
    fn truncate_aligns_to_epoch_grid() {
        assert_eq!(truncate_ms(0, MINUTE), 0);
        assert_eq!(truncate_ms(59_999, MINUTE), 0);
        assert_eq!(truncate_ms(60_000, MINUTE), 60_000);
        assert_eq!(truncate_ms(3_661_000, MINUTE), 3_660_000);
        // Pre-epoch timestamps stay on the same grid.
        assert_eq!(truncate_ms(-1, MINUTE), -60_000);
    }

    #[test]
    fn first_tick_opens_without_emitting() {
        let (agg, _) = minute_aggregator();
        let closed = agg.process(&tick("BTCUSDT", 50_000.0, 1.0, 1_000)).unwrap();
        assert!(closed.is_none());

        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.open_time, 0);
        assert_eq!(open.close_time, MINUTE);
        assert_eq!(open.open, 50_000.0);
    }

    #[test]
    fn single_window_aggregation() {
        // Interval 60s; four ticks inside the window, a fifth at t0+61s
        // closes it.
        let t0 = 1_700_000_040_000; // already a minute boundary
        let (agg, _) = minute_aggregator();

        assert!(agg.process(&tick("BTCUSDT", 50_000.0, 1.0, t0)).unwrap().is_none());
        assert!(agg.process(&tick("BTCUSDT", 50_100.0, 0.5, t0 + 10_000)).unwrap().is_none());
        assert!(agg.process(&tick("BTCUSDT", 49_900.0, 1.5, t0 + 30_000)).unwrap().is_none());
        assert!(agg.process(&tick("BTCUSDT", 50_050.0, 1.8, t0 + 50_000)).unwrap().is_none());

        let closed = agg
            .process(&tick("BTCUSDT", 51_000.0, 0.1, t0 + 61_000))
            .unwrap()
            .expect("fifth tick closes the window");

        assert_eq!(closed.open, 50_000.0);
        assert_eq!(closed.high, 50_100.0);
        assert_eq!(closed.low, 49_900.0);
        assert_eq!(closed.close, 50_050.0);
        assert_eq!(closed.volume, 4.8);
        assert_eq!(closed.open_time, t0);
        assert_eq!(closed.close_time, t0 + MINUTE);
        assert!(closed.is_valid());

        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.open, 51_000.0);
        assert_eq!(open.high, 51_000.0);
        assert_eq!(open.low, 51_000.0);
        assert_eq!(open.close, 51_000.0);
        assert_eq!(open.volume, 0.1);
        assert_eq!(open.open_time, t0 + MINUTE);
    }

    #[test]
    fn tick_exactly_on_close_time_starts_next_window() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        assert!(agg.process(&tick("BTCUSDT", 100.0, 1.0, t0 + 59_000)).unwrap().is_none());
        let closed = agg
            .process(&tick("BTCUSDT", 200.0, 1.0, t0 + 60_000))
            .unwrap()
            .expect("boundary tick belongs to the next window");

        assert_eq!(closed.close, 100.0);
        assert_eq!(closed.volume, 1.0);

        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.open, 200.0);
        assert_eq!(open.open_time, t0 + MINUTE);
    }

    #[test]
    fn large_gap_closes_exactly_one_candle() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        assert!(agg.process(&tick("BTCUSDT", 10.0, 1.0, t0 + 5_000)).unwrap().is_none());
        let closed = agg
            .process(&tick("BTCUSDT", 20.0, 1.0, t0 + 3_600_000))
            .unwrap()
            .expect("gap tick closes the stale window");

        // Only the previously open window comes back; the empty minutes in
        // between are not synthesized.
        assert_eq!(closed.open, 10.0);
        assert_eq!(closed.high, 10.0);
        assert_eq!(closed.low, 10.0);
        assert_eq!(closed.close, 10.0);
        assert_eq!(closed.volume, 1.0);
        assert_eq!(closed.open_time, t0);
        assert_eq!(closed.close_time, t0 + MINUTE);

        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.open_time, truncate_ms(t0 + 3_600_000, MINUTE));
    }

    #[test]
    fn out_of_order_tick_folds_into_open_window() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        agg.process(&tick("BTCUSDT", 100.0, 1.0, t0 + 30_000)).unwrap();
        // Older than the window's open_time: folds in, never backfills.
        agg.process(&tick("BTCUSDT", 80.0, 2.0, t0 - 10_000)).unwrap();

        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.open, 100.0);
        assert_eq!(open.low, 80.0);
        assert_eq!(open.close, 80.0);
        assert_eq!(open.volume, 3.0);
        assert_eq!(open.open_time, t0);
    }

    #[test]
    fn symbols_are_windowed_independently() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        agg.process(&tick("BTCUSDT", 100.0, 1.0, t0)).unwrap();
        agg.process(&tick("ETHUSDT", 10.0, 5.0, t0)).unwrap();

        // Rolling BTCUSDT over must not disturb ETHUSDT.
        let closed = agg
            .process(&tick("BTCUSDT", 101.0, 1.0, t0 + MINUTE))
            .unwrap()
            .unwrap();
        assert_eq!(closed.symbol, Symbol::from("BTCUSDT"));
        let eth = agg.current(&Symbol::from("ETHUSDT")).unwrap();
        assert_eq!(eth.open_time, t0);
        assert_eq!(eth.volume, 5.0);
    }

    #[test]
    fn emitted_open_times_are_strictly_increasing_multiples() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        let mut emitted = Vec::new();
        for (i, ts) in [t0, t0 + 61_000, t0 + 185_000, t0 + 600_000, t0 + 601_000]
            .into_iter()
            .enumerate()
        {
            if let Some(c) = agg.process(&tick("BTCUSDT", 100.0 + i as f64, 1.0, ts)).unwrap() {
                emitted.push(c);
            }
        }

        let opens: Vec<i64> = emitted.iter().map(|c| c.open_time).collect();
        assert!(opens.windows(2).all(|w| w[0] < w[1]));
        assert!(opens.iter().all(|t| t % MINUTE == 0));
        assert!(emitted.iter().all(|c| c.close_time - c.open_time == MINUTE));
    }

    #[test]
    fn replay_is_deterministic() {
        let t0 = 1_700_000_040_000;
        let ticks: Vec<Tick> = (0..200)
            .map(|i| {
                tick(
                    "BTCUSDT",
                    100.0 + f64::from(i % 17),
                    0.1 * f64::from(i % 5 + 1),
                    t0 + i64::from(i) * 7_000,
                )
            })
            .collect();

        let run = |ticks: &[Tick]| {
            let (agg, _) = minute_aggregator();
            let mut out = Vec::new();
            for t in ticks {
                if let Some(c) = agg.process(t).unwrap() {
                    assert!(c.is_valid());
                    out.push(c);
                }
            }
            out
        };

        assert_eq!(run(&ticks), run(&ticks));
    }

    #[test]
    fn volume_equals_sum_of_participating_quantities() {
        let t0 = 1_700_000_040_000;
        let (agg, _) = minute_aggregator();

        let quantities = [0.25, 1.5, 0.125, 2.0];
        for (i, q) in quantities.iter().enumerate() {
            agg.process(&tick("BTCUSDT", 100.0, *q, t0 + i as i64 * 1_000)).unwrap();
        }
        let closed = agg
            .process(&tick("BTCUSDT", 100.0, 9.0, t0 + MINUTE))
            .unwrap()
            .unwrap();
        assert_eq!(closed.volume, quantities.iter().sum::<f64>());
    }

    #[test]
    fn store_failure_drops_tick_from_aggregation() {
        let t0 = 1_700_000_040_000;
        let (agg, sink) = minute_aggregator();

        agg.process(&tick("BTCUSDT", 100.0, 1.0, t0)).unwrap();

        sink.fail_ticks(true);
        let err = agg.process(&tick("BTCUSDT", 500.0, 1.0, t0 + 1_000));
        assert!(err.is_err());

        // The failed tick left no trace in the open window.
        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.high, 100.0);
        assert_eq!(open.volume, 1.0);

        // Recovery: later ticks aggregate normally.
        sink.fail_ticks(false);
        agg.process(&tick("BTCUSDT", 110.0, 1.0, t0 + 2_000)).unwrap();
        let open = agg.current(&Symbol::from("BTCUSDT")).unwrap();
        assert_eq!(open.high, 110.0);
        assert_eq!(open.volume, 2.0);
    }

    #[test]
    fn every_processed_tick_is_persisted() {
        let t0 = 1_700_000_040_000;
        let (agg, sink) = minute_aggregator();

        for i in 0..5 {
            agg.process(&tick("BTCUSDT", 100.0, 1.0, t0 + i * 1_000)).unwrap();
        }
        assert_eq!(sink.tick_count(), 5);
    }

    #[test]
    #[should_panic(expected = "interval must be positive")]
    fn zero_interval_panics() {
        let sink = Arc::new(MemorySink::default());
        let _ = Aggregator::new(Duration::ZERO, sink);
    }
}
