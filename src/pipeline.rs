//! Pipeline wiring: feed -> tick queue -> aggregator -> (sink, broker).
//!
//! Owns the bounded tick queue and its single consumer task. The consumer
//! is the only writer of aggregator state and the only hot-path caller of
//! `broker.publish`, which is what makes the aggregator map a single-writer
//! structure. Ingest pushes into the queue with drop-on-full sends, so a
//! stalled consumer can never stall the feed's read loop.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::broker::Broker;
use crate::error::Error;
use crate::ingest::FeedClient;
use crate::metrics::PipelineMetrics;
use crate::sink::Sink;
use crate::types::{Symbol, Tick};

/// Glues ingest, aggregation, persistence, and fan-out together.
pub struct Pipeline {
    client: FeedClient,
    aggregator: Arc<Aggregator>,
    broker: Arc<Broker>,
    sink: Arc<dyn Sink>,
    metrics: Arc<PipelineMetrics>,
    symbols: Vec<Symbol>,
    channel_size: usize,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    #[expect(clippy::too_many_arguments)] // Assembled once, in main.
    #[must_use]
    pub fn new(
        client: FeedClient,
        aggregator: Arc<Aggregator>,
        broker: Arc<Broker>,
        sink: Arc<dyn Sink>,
        metrics: Arc<PipelineMetrics>,
        symbols: Vec<Symbol>,
        channel_size: usize,
        shutdown_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            aggregator,
            broker,
            sink,
            metrics,
            symbols,
            channel_size,
            shutdown_timeout,
            cancel,
            started: AtomicBool::new(false),
            consumer: Mutex::new(None),
        }
    }

    /// Register the tick queue with the feed for every configured symbol,
    /// connect upstream, and launch the consumer task. Idempotent: calls
    /// after the first return immediately.
    ///
    /// # Errors
    ///
    /// [`Error::Connect`] / [`Error::Cancelled`] from the feed client.
    pub async fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Relaxed) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<Tick>(self.channel_size);
        for symbol in &self.symbols {
            self.client.subscribe(symbol.clone(), tx.clone());
        }

        self.client.connect(&self.symbols).await?;

        let handle = tokio::spawn(consume(
            rx,
            self.aggregator.clone(),
            self.broker.clone(),
            self.sink.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));
        *self.consumer.lock().expect("consumer slot poisoned") = Some(handle);

        info!(symbols = ?self.symbols, "pipeline started");
        Ok(())
    }

    /// Signal cancellation, wait for the consumer to drain (bounded by the
    /// shutdown deadline), then close the feed client and sink, in that
    /// order.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.consumer.lock().expect("consumer slot poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("tick consumer did not stop before the shutdown deadline");
            }
        }

        self.client.close();
        if let Err(e) = self.sink.close() {
            warn!(error = %e, "sink close failed");
        }
        info!("pipeline stopped");
    }
}

/// The single tick consumer. Runs until cancellation or until the queue
/// closes, then drains whatever ingest already queued.
async fn consume(
    mut rx: mpsc::Receiver<Tick>,
    aggregator: Arc<Aggregator>,
    broker: Arc<Broker>,
    sink: Arc<dyn Sink>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            tick = rx.recv() => match tick {
                Some(tick) => handle_tick(&tick, &aggregator, &broker, &sink, &metrics),
                None => break,
            },
        }
    }

    // Drain-on-shutdown: whatever is already queued still counts. stop()
    // bounds this with the shutdown deadline.
    while let Ok(tick) = rx.try_recv() {
        handle_tick(&tick, &aggregator, &broker, &sink, &metrics);
    }
    info!("tick consumer stopped");
}

fn handle_tick(
    tick: &Tick,
    aggregator: &Aggregator,
    broker: &Broker,
    sink: &Arc<dyn Sink>,
    metrics: &PipelineMetrics,
) {
    metrics.ticks_processed.fetch_add(1, Relaxed);

    match aggregator.process(tick) {
        Err(e) => {
            metrics.store_errors.fetch_add(1, Relaxed);
            error!(symbol = %tick.symbol, error = %e, "tick dropped: raw store failed");
        }
        Ok(None) => {}
        Ok(Some(candle)) => {
            metrics.candles_closed.fetch_add(1, Relaxed);
            // Persist-then-broadcast: a failed candle write is logged but
            // the candle is still fanned out. Durability trades against
            // liveness here, explicitly.
            if let Err(e) = sink.store_ohlc(&candle) {
                metrics.store_errors.fetch_add(1, Relaxed);
                error!(symbol = %candle.symbol, error = %e, "candle store failed");
            }
            broker.publish(&candle);
        }
    }
}
