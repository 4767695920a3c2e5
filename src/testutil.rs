//! Shared test fixtures and helpers.
//!
//! Reusable constructors for domain types plus an in-memory [`Sink`] with
//! failure injection, used across multiple `#[cfg(test)]` modules.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::sink::Sink;
use crate::types::{Ohlc, Symbol, Tick};

/// `Tick` from plain parts (test convenience).
pub(crate) fn tick(symbol: &str, price: f64, quantity: f64, timestamp: i64) -> Tick {
    Tick {
        symbol: Symbol::from(symbol),
        price,
        quantity,
        timestamp,
    }
}

/// Flat candle over `[open_time, open_time + interval_ms)`.
pub(crate) fn ohlc(symbol: &str, open_time: i64, interval_ms: i64) -> Ohlc {
    Ohlc {
        symbol: Symbol::from(symbol),
        open: 100.0,
        high: 100.0,
        low: 100.0,
        close: 100.0,
        volume: 1.0,
        open_time,
        close_time: open_time + interval_ms,
    }
}

/// In-memory sink with per-operation failure injection.
#[derive(Default)]
pub(crate) struct MemorySink {
    ticks: Mutex<Vec<Tick>>,
    ohlcs: Mutex<Vec<Ohlc>>,
    fail_ticks: AtomicBool,
    fail_ohlcs: AtomicBool,
}

impl MemorySink {
    pub(crate) fn fail_ticks(&self, fail: bool) {
        self.fail_ticks.store(fail, Relaxed);
    }

    pub(crate) fn fail_ohlcs(&self, fail: bool) {
        self.fail_ohlcs.store(fail, Relaxed);
    }

    pub(crate) fn tick_count(&self) -> usize {
        self.ticks.lock().expect("lock poisoned").len()
    }

    pub(crate) fn ohlc_count(&self) -> usize {
        self.ohlcs.lock().expect("lock poisoned").len()
    }
}

impl Sink for MemorySink {
    fn store_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        if self.fail_ticks.load(Relaxed) {
            return Err(StoreError::Retriable {
                op: "store_tick",
                source: "injected failure".into(),
            });
        }
        self.ticks.lock().expect("lock poisoned").push(tick.clone());
        Ok(())
    }

    fn store_ohlc(&self, ohlc: &Ohlc) -> Result<(), StoreError> {
        if self.fail_ohlcs.load(Relaxed) {
            return Err(StoreError::Retriable {
                op: "store_ohlc",
                source: "injected failure".into(),
            });
        }
        self.ohlcs.lock().expect("lock poisoned").push(ohlc.clone());
        Ok(())
    }

    fn query_range(&self, symbol: &Symbol, start: i64, end: i64) -> Result<Vec<Ohlc>, StoreError> {
        let mut rows: Vec<Ohlc> = self
            .ohlcs
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|o| o.symbol == *symbol && o.open_time >= start && o.close_time <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.open_time);
        Ok(rows)
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
