//! Core domain types for the candlestick pipeline.

use std::fmt;

/// Trading pair identifier, e.g. `BTCUSDT`.
///
/// Opaque equality/hash key. Never parsed; the only transformation applied
/// anywhere is lowercasing for the upstream stream parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream parameter for the upstream subscription request.
    #[must_use]
    pub fn stream_param(&self) -> String {
        format!("{}@aggTrade", self.0.to_lowercase())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single trade observation from the upstream feed.
///
/// Created by the ingest client, consumed exactly once by the pipeline's
/// tick consumer, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: f64,
    /// Base-asset quantity traded. Non-negative.
    pub quantity: f64,
    /// Exchange event time, Unix milliseconds.
    pub timestamp: i64,
}

/// One candlestick over the half-open window `[open_time, close_time)`.
///
/// Mutable while open (owned by the aggregator), frozen once closed and
/// handed off to the sink and broker by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Ohlc {
    pub symbol: Symbol,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Window start, Unix milliseconds, a multiple of the interval.
    pub open_time: i64,
    /// `open_time + interval`, Unix milliseconds.
    pub close_time: i64,
}

impl Ohlc {
    /// Open a fresh window from the first tick in it. All four prices start
    /// at the trade price.
    #[must_use]
    pub fn open_at(tick: &Tick, open_time: i64, interval_ms: i64) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
            open_time,
            close_time: open_time + interval_ms,
        }
    }

    /// Fold a later tick from the same window into the candle. `open` and
    /// `open_time` are never touched after construction.
    pub fn extend(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.quantity;
    }

    /// Candle integrity check: `low <= open,close <= high`, non-negative
    /// volume, non-empty window.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
            && self.open_time < self.close_time
    }
}
