//! Lock-free metrics with Prometheus text exposition and health endpoint.
//!
//! Hot-path counters are bare atomics handed to each component at startup --
//! the ingest client, pipeline consumer, and broker each hold their own
//! `Arc` slice of the registry, so nothing on the tick path does a map
//! lookup or takes a lock to count.
//!
//! The decode histogram uses 1-2-5 logarithmic buckets from 1 microsecond to
//! 10 seconds: JSON decode sits in the low microseconds, while SQLite writes
//! and reconnect-burst stalls land in the millisecond tail.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ---------------------------------------------------------------------------
// Prometheus histogram with logarithmic buckets (1µs – 10s)
// ---------------------------------------------------------------------------

const NUM_BUCKETS: usize = 14;

/// Upper bounds in nanoseconds + Prometheus `le` label strings.
const BUCKETS: [(u64, &str); NUM_BUCKETS] = [
    (1_000, "0.000001"),          // 1µs
    (2_000, "0.000002"),          // 2µs
    (5_000, "0.000005"),          // 5µs
    (10_000, "0.00001"),          // 10µs
    (50_000, "0.00005"),          // 50µs
    (100_000, "0.0001"),          // 100µs
    (500_000, "0.0005"),          // 500µs
    (1_000_000, "0.001"),         // 1ms
    (5_000_000, "0.005"),         // 5ms
    (10_000_000, "0.01"),         // 10ms
    (50_000_000, "0.05"),         // 50ms
    (100_000_000, "0.1"),         // 100ms
    (1_000_000_000, "1"),         // 1s
    (10_000_000_000, "10"),       // 10s
];

pub struct Histogram {
    /// Per-bucket (non-cumulative) counters; the last slot is the +Inf
    /// overflow bucket. O(1) record, cumulative sums computed on the cold
    /// scrape path.
    buckets: [AtomicU64; NUM_BUCKETS + 1],
    sum_ns: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; NUM_BUCKETS + 1],
            sum_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one duration observation: a bucket scan over a 14-entry table
    /// and one `fetch_add`.
    pub fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        let mut idx = NUM_BUCKETS; // overflow slot
        for (i, &(bound_ns, _)) in BUCKETS.iter().enumerate() {
            if nanos <= bound_ns {
                idx = i;
                break;
            }
        }

        self.buckets[idx].fetch_add(1, Relaxed);
        self.sum_ns.fetch_add(nanos, Relaxed);
        self.count.fetch_add(1, Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        let mut cumulative = 0u64;
        for (i, &(_, le)) in BUCKETS.iter().enumerate() {
            cumulative += self.buckets[i].load(Relaxed);
            writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}").expect("write to String");
        }

        let total = self.count.load(Relaxed);
        writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}").expect("write to String");

        let sum_secs = self.sum_ns.load(Relaxed) as f64 / 1_000_000_000.0;
        writeln!(out, "{name}_sum {sum_secs}").expect("write to String");
        writeln!(out, "{name}_count {total}").expect("write to String");
    }
}

// ---------------------------------------------------------------------------
// Per-component handles
// ---------------------------------------------------------------------------

/// Counters owned by the upstream feed client.
pub struct FeedMetrics {
    /// WebSocket frames received (any shape).
    pub frames: AtomicU64,
    /// Frames that failed JSON/numeric parsing.
    pub parse_errors: AtomicU64,
    /// Sessions torn down and handed to the reconnect supervisor.
    pub reconnects: AtomicU64,
    /// Ticks dropped because a consumer queue was full.
    pub ticks_dropped: AtomicU64,
    /// Live upstream session present.
    pub connected: AtomicBool,
    /// Frame classify+parse latency.
    pub decode_latency: Histogram,
}

/// Counters owned by the pipeline's tick consumer.
pub struct PipelineMetrics {
    pub ticks_processed: AtomicU64,
    pub candles_closed: AtomicU64,
    pub store_errors: AtomicU64,
}

/// Counters owned by the fan-out broker.
pub struct FanoutMetrics {
    pub published: AtomicU64,
    /// Candles discarded at a full subscriber queue. Bookkeeping only.
    pub subscriber_drops: AtomicU64,
    /// Current registry entry count.
    pub active_subscriptions: AtomicU64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Metrics {
    feed: Arc<FeedMetrics>,
    pipeline: Arc<PipelineMetrics>,
    fanout: Arc<FanoutMetrics>,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::register()
    }
}

impl Metrics {
    /// Create the registry and per-component handles.
    #[must_use]
    pub fn register() -> Self {
        Self {
            feed: Arc::new(FeedMetrics {
                frames: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                ticks_dropped: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                decode_latency: Histogram::new(),
            }),
            pipeline: Arc::new(PipelineMetrics {
                ticks_processed: AtomicU64::new(0),
                candles_closed: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
            }),
            fanout: Arc::new(FanoutMetrics {
                published: AtomicU64::new(0),
                subscriber_drops: AtomicU64::new(0),
                active_subscriptions: AtomicU64::new(0),
            }),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn feed(&self) -> Arc<FeedMetrics> {
        self.feed.clone()
    }

    #[must_use]
    pub fn pipeline(&self) -> Arc<PipelineMetrics> {
        self.pipeline.clone()
    }

    #[must_use]
    pub fn fanout(&self) -> Arc<FanoutMetrics> {
        self.fanout.clone()
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        let mut counter = |name: &str, help: &str, value: u64| {
            writeln!(out, "# HELP {name} {help}").expect("write to String");
            writeln!(out, "# TYPE {name} counter").expect("write to String");
            writeln!(out, "{name} {value}").expect("write to String");
        };

        counter(
            "ohlc_feed_frames_total",
            "WebSocket frames received from the upstream feed",
            self.feed.frames.load(Relaxed),
        );
        counter(
            "ohlc_feed_parse_errors_total",
            "Frames dropped due to JSON or numeric parse failure",
            self.feed.parse_errors.load(Relaxed),
        );
        counter(
            "ohlc_feed_reconnects_total",
            "Upstream sessions handed to the reconnect supervisor",
            self.feed.reconnects.load(Relaxed),
        );
        counter(
            "ohlc_feed_ticks_dropped_total",
            "Ticks dropped at a full consumer queue",
            self.feed.ticks_dropped.load(Relaxed),
        );
        counter(
            "ohlc_ticks_processed_total",
            "Ticks folded into aggregation",
            self.pipeline.ticks_processed.load(Relaxed),
        );
        counter(
            "ohlc_candles_closed_total",
            "Candles closed by window rollover",
            self.pipeline.candles_closed.load(Relaxed),
        );
        counter(
            "ohlc_store_errors_total",
            "Failed durable writes (ticks and candles)",
            self.pipeline.store_errors.load(Relaxed),
        );
        counter(
            "ohlc_published_total",
            "Closed candles handed to the fan-out broker",
            self.fanout.published.load(Relaxed),
        );
        counter(
            "ohlc_subscriber_drops_total",
            "Candles dropped at a full subscriber queue",
            self.fanout.subscriber_drops.load(Relaxed),
        );

        let mut gauge = |name: &str, help: &str, value: u64| {
            writeln!(out, "# HELP {name} {help}").expect("write to String");
            writeln!(out, "# TYPE {name} gauge").expect("write to String");
            writeln!(out, "{name} {value}").expect("write to String");
        };

        gauge(
            "ohlc_feed_up",
            "Upstream feed connection status (1=connected)",
            u64::from(self.feed.connected.load(Relaxed)),
        );
        gauge(
            "ohlc_active_subscriptions",
            "Currently registered subscriber queues",
            self.fanout.active_subscriptions.load(Relaxed),
        );
        gauge(
            "ohlc_uptime_seconds",
            "Seconds since process start",
            self.start_time.elapsed().as_secs(),
        );

        writeln!(
            out,
            "# HELP ohlc_decode_duration_seconds Feed frame decode latency"
        )
        .expect("write to String");
        writeln!(out, "# TYPE ohlc_decode_duration_seconds histogram").expect("write to String");
        self.feed
            .decode_latency
            .render("ohlc_decode_duration_seconds", &mut out);

        out
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Serve `/health` and `/metrics` on the given port.
pub async fn serve_http(port: u16, metrics: Arc<Metrics>, cancel: CancellationToken) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom_metrics))
        .with_state(metrics);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(port, error = %e, "failed to bind metrics port");
            cancel.cancel();
            return;
        }
    };

    info!(port, "metrics/health HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .ok();
}

/// `GET /health` -- `OK` while the upstream feed is connected, `DOWN`
/// otherwise (including while the reconnect supervisor is working).
async fn health(State(m): State<Arc<Metrics>>) -> (StatusCode, &'static str) {
    if m.feed.connected.load(Relaxed) {
        (StatusCode::OK, "OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n")
    }
}

/// `GET /metrics` -- Prometheus text exposition format.
async fn prom_metrics(State(m): State<Arc<Metrics>>) -> String {
    m.to_prometheus()
}
