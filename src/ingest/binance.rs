//! Binance aggregate-trade frame shapes and parsing.
//!
//! Three disjoint shapes come over the stream: subscription acks (presence
//! of a `result` field), `aggTrade` events, and everything else. A frame
//! that fails to parse is dropped by the caller after logging -- a bad
//! frame is never fatal to the session.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{Symbol, Tick};

/// Subscription request payload, e.g.
/// `{"method":"SUBSCRIBE","params":["btcusdt@aggTrade"],"id":1}`.
#[must_use]
pub fn subscribe_request(symbols: &[Symbol]) -> String {
    let params: Vec<String> = symbols.iter().map(Symbol::stream_param).collect();
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": 1,
    })
    .to_string()
}

/// One classified inbound frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Subscription acknowledgement; carries the request id when present.
    Ack { id: Option<i64> },
    /// Normalized trade.
    Trade(Tick),
    /// Valid JSON of some other shape -- skipped.
    Ignored,
}

/// Why a frame was dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("aggTrade frame missing or unparseable field `{field}`")]
    Field { field: &'static str },
}

/// Wire shape of an aggregate-trade event. Fields the aggregator never
/// looks at (trade ids, maker flag) are left to serde to skip.
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    timestamp: i64,
}

/// Classify one text frame from the stream.
///
/// `price` (`p`) and `quantity` (`q`) arrive as decimal strings and are
/// parsed as f64; the event time `T` is Unix milliseconds.
pub fn classify(text: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(obj) = value.as_object() else {
        return Ok(Frame::Ignored);
    };

    // Ack shape: `{"result":null,"id":1}`. The result value itself carries
    // nothing useful.
    if obj.contains_key("result") {
        return Ok(Frame::Ack {
            id: obj.get("id").and_then(Value::as_i64),
        });
    }

    if obj.get("e").and_then(Value::as_str) != Some("aggTrade") {
        return Ok(Frame::Ignored);
    }

    let event: AggTradeEvent = serde_json::from_value(value)?;
    let price: f64 = event
        .price
        .parse()
        .map_err(|_| FrameError::Field { field: "p" })?;
    let quantity: f64 = event
        .quantity
        .parse()
        .map_err(|_| FrameError::Field { field: "q" })?;

    Ok(Frame::Trade(Tick {
        symbol: Symbol::new(event.symbol),
        price,
        quantity,
        timestamp: event.timestamp,
    }))
}
