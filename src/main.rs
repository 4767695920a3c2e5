//! OHLC stream service.
//!
//! Connects to the exchange aggregate-trade feed, folds trades into
//! fixed-interval candlesticks, persists ticks and closed candles, and
//! streams closed candles to gRPC subscribers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use ohlc_stream::aggregator::Aggregator;
use ohlc_stream::broker::Broker;
use ohlc_stream::config::Config;
use ohlc_stream::error::Error;
use ohlc_stream::ingest::FeedClient;
use ohlc_stream::metrics::{self, Metrics};
use ohlc_stream::pipeline::Pipeline;
use ohlc_stream::server::proto::ohlc_service_server::OhlcServiceServer;
use ohlc_stream::server::StreamingService;
use ohlc_stream::sink::{Sink, SqliteSink};

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    info!(
        profile = %Config::profile(),
        symbols = ?config.symbols,
        interval_secs = config.interval_secs,
        addr = %config.addr,
        "starting ohlc stream service"
    );

    let cancel = CancellationToken::new();
    let registry = Arc::new(Metrics::register());

    let sink: Arc<dyn Sink> = Arc::new(SqliteSink::open(config.db_path())?);
    let aggregator = Arc::new(Aggregator::new(config.interval(), sink.clone()));
    let broker = Arc::new(Broker::new(config.max_subscribers, registry.fanout()));
    let client = FeedClient::new(
        config.feed_options(),
        cancel.child_token(),
        registry.feed(),
    );

    let pipeline = Pipeline::new(
        client,
        aggregator,
        broker.clone(),
        sink,
        registry.pipeline(),
        config.symbols(),
        config.channel_size,
        config.shutdown_timeout(),
        cancel.clone(),
    );
    pipeline.start().await?;

    // Metrics/health HTTP server.
    tokio::spawn(metrics::serve_http(
        config.metrics_port,
        registry.clone(),
        cancel.clone(),
    ));

    // gRPC server with graceful shutdown.
    let addr = config.addr.parse()?;
    let service = StreamingService::new(broker, config.channel_size, cancel.clone());
    info!(%addr, "gRPC server listening");

    let server_cancel = cancel.clone();
    let server = Server::builder()
        .add_service(OhlcServiceServer::new(service))
        .serve_with_shutdown(addr, async move {
            server_cancel.cancelled().await;
        });

    // Ctrl+C handler.
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl+c, shutting down");
        }
        shutdown_cancel.cancel();
    });

    // Run server (blocks until shutdown).
    server.await?;

    pipeline.stop().await;

    info!("shutdown complete");
    Ok(())
}
