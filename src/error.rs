//! Crate error taxonomy.
//!
//! Only three failures cross the public surface: endpoint exhaustion on
//! connect, subscriber capacity, and cancellation. Read, parse, and store
//! failures on the hot path are handled where they occur -- logged, counted,
//! and where the connection itself is broken, answered with a reconnect.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for the candlestick stream service.
#[derive(Debug, Error)]
pub enum Error {
    /// Every feed endpoint x retry was exhausted without a live
    /// subscription. Fatal to the pipeline.
    #[error("feed connect failed after {attempts} attempts across {endpoints} endpoints: {last}")]
    Connect {
        attempts: u32,
        endpoints: usize,
        last: String,
    },

    /// The broker is at `max_subscribers`. Surfaced to the RPC caller as a
    /// call-level error.
    #[error("subscriber capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    /// Shutdown was requested while the operation was in flight. Expected
    /// during teardown, never logged as a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// gRPC transport failure (bind/serve).
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),
}

/// Durable-sink failure with an advisory retriable/fatal classification.
///
/// The classification never drives control flow in the pipeline -- a failed
/// `store_tick` drops that tick from aggregation and a failed `store_ohlc`
/// is logged while the candle is still broadcast -- but it tells operators
/// whether the store itself needs attention.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O: busy database, lock contention, interrupted write.
    /// Retrying the same operation can succeed.
    #[error("transient store failure in {op}: {source}")]
    Retriable {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Schema or configuration problem. Retrying cannot help.
    #[error("fatal store failure in {op}: {source}")]
    Fatal {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The sink was closed before the call.
    #[error("{op} called on closed sink")]
    Closed { op: &'static str },
}

impl StoreError {
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. })
    }

    /// Sort a SQLite error into the retriable or fatal bucket.
    pub(crate) fn classify(op: &'static str, source: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::{DatabaseBusy, DatabaseLocked, DiskFull, SystemIoFailure};

        let retriable = matches!(
            &source,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, DatabaseBusy | DatabaseLocked | SystemIoFailure | DiskFull)
        );
        if retriable {
            Self::Retriable {
                op,
                source: Box::new(source),
            }
        } else {
            Self::Fatal {
                op,
                source: Box::new(source),
            }
        }
    }
}
