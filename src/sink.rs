//! Durable, append-only persistence for raw ticks and closed candles.
//!
//! [`Sink`] is the capability boundary the aggregator and pipeline write
//! through; tests substitute an in-memory fake. [`SqliteSink`] is the
//! production implementation: two append tables keyed by `(symbol, time)`
//! with ordered range reads per symbol.
//!
//! `store_tick` and `store_ohlc` are independent -- a tick is never
//! persisted atomically with the candle it contributes to.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::StoreError;
use crate::types::{Ohlc, Symbol, Tick};

/// Capability surface of the durable store.
///
/// `close` is part of the trait so shutdown never needs to know the
/// concrete type behind the `Arc<dyn Sink>`.
pub trait Sink: Send + Sync {
    /// Append one raw tick.
    fn store_tick(&self, tick: &Tick) -> Result<(), StoreError>;

    /// Append one closed candle.
    fn store_ohlc(&self, ohlc: &Ohlc) -> Result<(), StoreError>;

    /// Closed candles for `symbol` with `open_time >= start` and
    /// `close_time <= end`, ordered by `open_time` ascending. Offline use
    /// only; never called on the hot path.
    fn query_range(&self, symbol: &Symbol, start: i64, end: i64) -> Result<Vec<Ohlc>, StoreError>;

    /// Release the underlying store. Idempotent; later writes fail with
    /// [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tick (
    symbol    TEXT NOT NULL,
    price     REAL NOT NULL,
    quantity  REAL NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tick_symbol_time ON tick (symbol, timestamp);

CREATE TABLE IF NOT EXISTS ohlc (
    symbol     TEXT NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     REAL NOT NULL,
    open_time  INTEGER NOT NULL,
    close_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ohlc_symbol_open ON ohlc (symbol, open_time);
CREATE INDEX IF NOT EXISTS idx_ohlc_close ON ohlc (close_time);
";

/// SQLite-backed sink. All access goes through one connection; the single
/// pipeline writer and the off-hot-path range reads serialize on it.
pub struct SqliteSink {
    // None after close(). The mutex is the connection's own guard, not a
    // pipeline lock -- aggregator and broker state never wait on it.
    conn: Mutex<Option<Connection>>,
}

impl SqliteSink {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn =
            Connection::open(path.as_ref()).map_err(|e| StoreError::classify("open", e))?;
        Self::bootstrap(conn)
    }

    /// Fully in-memory sink. Used by tests and benchmarks.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::classify("open", e))?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::classify("migrate", e))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().expect("sink lock poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed { op })?;
        f(conn).map_err(|e| StoreError::classify(op, e))
    }
}

impl Sink for SqliteSink {
    fn store_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        self.with_conn("store_tick", |conn| {
            conn.execute(
                "INSERT INTO tick (symbol, price, quantity, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![tick.symbol.as_str(), tick.price, tick.quantity, tick.timestamp],
            )
            .map(|_| ())
        })
    }

    fn store_ohlc(&self, ohlc: &Ohlc) -> Result<(), StoreError> {
        self.with_conn("store_ohlc", |conn| {
            conn.execute(
                "INSERT INTO ohlc (symbol, open, high, low, close, volume, open_time, close_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ohlc.symbol.as_str(),
                    ohlc.open,
                    ohlc.high,
                    ohlc.low,
                    ohlc.close,
                    ohlc.volume,
                    ohlc.open_time,
                    ohlc.close_time
                ],
            )
            .map(|_| ())
        })
    }

    fn query_range(&self, symbol: &Symbol, start: i64, end: i64) -> Result<Vec<Ohlc>, StoreError> {
        self.with_conn("query_range", |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, open, high, low, close, volume, open_time, close_time
                 FROM ohlc
                 WHERE symbol = ?1 AND open_time >= ?2 AND close_time <= ?3
                 ORDER BY open_time ASC",
            )?;
            let rows = stmt.query_map(params![symbol.as_str(), start, end], |row| {
                Ok(Ohlc {
                    symbol: Symbol::new(row.get::<_, String>(0)?),
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    open_time: row.get(6)?,
                    close_time: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().expect("sink lock poisoned");
        if let Some(conn) = guard.take() {
            info!("closing sink");
            conn.close()
                .map_err(|(_, e)| StoreError::classify("close", e))?;
        }
        Ok(())
    }
}
