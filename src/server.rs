//! gRPC server implementing the [`OhlcService`] streaming RPC.
//!
//! `StreamOHLC` registers the caller's delivery queue with the broker for
//! every requested symbol and streams candles until the caller goes away.
//! Proto conversion happens here, on the per-client tonic task, keeping the
//! pipeline's hot path free of serialization. The server ends a stream only
//! on shutdown; slow callers silently miss candles (drop-on-full at the
//! broker), and disconnecting callers are unsubscribed by the stream's drop
//! guard.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::{Request, Response, Status};
use tracing::info;

use crate::broker::Broker;
use crate::types::{Ohlc, Symbol};

#[allow(clippy::pedantic)] // Generated code.
pub mod proto {
    tonic::include_proto!("ohlc");
}

use proto::ohlc_service_server::OhlcService;

/// gRPC service backed by the fan-out broker.
pub struct StreamingService {
    broker: Arc<Broker>,
    /// Capacity of each subscriber's delivery queue.
    channel_size: usize,
    /// Ends every open stream on shutdown so graceful stop can finish.
    cancel: CancellationToken,
}

impl StreamingService {
    #[must_use]
    pub fn new(broker: Arc<Broker>, channel_size: usize, cancel: CancellationToken) -> Self {
        Self {
            broker,
            channel_size,
            cancel,
        }
    }
}

type CandleResult = Result<proto::OhlcData, Status>;

#[tonic::async_trait]
impl OhlcService for StreamingService {
    type StreamOHLCStream = Pin<Box<dyn Stream<Item = CandleResult> + Send>>;

    async fn stream_ohlc(
        &self,
        request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::StreamOHLCStream>, Status> {
        let symbols: Vec<Symbol> = request
            .into_inner()
            .symbols
            .into_iter()
            .map(Symbol::from)
            .collect();
        if symbols.is_empty() {
            return Err(Status::invalid_argument("no symbols requested"));
        }

        let (tx, rx) = mpsc::channel::<Ohlc>(self.channel_size);
        let mut registered = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if let Err(e) = self.broker.subscribe(symbol.clone(), tx.clone()) {
                // Roll back the partial registration before failing the call.
                for done in &registered {
                    self.broker.unsubscribe(done, &tx);
                }
                return Err(Status::resource_exhausted(e.to_string()));
            }
            registered.push(symbol);
        }

        info!(symbols = ?registered, "subscriber connected");

        let guard = SubscriptionGuard {
            broker: self.broker.clone(),
            symbols: registered,
            queue: tx,
        };
        let stream = CandleStream {
            inner: ReceiverStream::new(rx).map(|candle| Ok(to_proto(candle))),
            shutdown: Box::pin(self.cancel.clone().cancelled_owned()),
            _guard: guard,
        };
        Ok(Response::new(Box::pin(stream)))
    }
}

/// Unsubscribes the delivery queue when the RPC ends -- client close,
/// network error, or server shutdown all land here via drop.
struct SubscriptionGuard {
    broker: Arc<Broker>,
    symbols: Vec<Symbol>,
    queue: mpsc::Sender<Ohlc>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        for symbol in &self.symbols {
            self.broker.unsubscribe(symbol, &self.queue);
        }
        info!(symbols = ?self.symbols, "subscriber disconnected");
    }
}

/// Receiver stream that keeps its broker registration alive exactly as
/// long as tonic polls it, and terminates when shutdown is signalled.
struct CandleStream<S> {
    inner: S,
    shutdown: Pin<Box<WaitForCancellationFutureOwned>>,
    _guard: SubscriptionGuard,
}

impl<S: Stream<Item = CandleResult> + Unpin> Stream for CandleStream<S> {
    type Item = CandleResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.shutdown.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// `Ohlc` -> proto. Runs on the per-client task, off the publish path.
fn to_proto(candle: Ohlc) -> proto::OhlcData {
    proto::OhlcData {
        symbol: candle.symbol.as_str().to_string(),
        open: candle.open,
        high: candle.high,
        low: candle.low,
        close: candle.close,
        volume: candle.volume,
        open_time: candle.open_time,
        close_time: candle.close_time,
    }
}
