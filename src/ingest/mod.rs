//! Upstream feed ingest.
//!
//! [`FeedClient`] keeps one live WebSocket session to the exchange's
//! aggregate-trade stream, normalizes events into [`Tick`]s, and fans them
//! out to registered per-symbol consumer queues with drop-on-full sends.
//! Endpoint failover, dial and ack deadlines, heartbeats, and reconnection
//! are internal: once `connect` has returned, the session heals itself
//! until `close`.
//!
//! Failure handling is one-way. `connect` surfaces an error only after
//! every endpoint and retry is exhausted; everything that happens after a
//! session is live -- read errors, parse errors, missed heartbeats --
//! tears the session down and hands the symbols to a fresh reconnect task.
//! The reconnect path holds no locks and never recurses.

pub mod binance;
mod proxy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::metrics::FeedMetrics;
use crate::types::{Symbol, Tick};

use binance::Frame;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binance aggregate-trade endpoints, tried round-robin with failover.
pub const DEFAULT_ENDPOINTS: [&str; 3] = [
    "wss://stream.binance.com:9443/ws",
    "wss://stream-alt1.binance.com:9443/ws",
    "wss://stream-alt2.binance.com:9443/ws",
];

/// Dial, retry, and liveness tuning for the upstream session.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Ordered endpoint list; failover walks it round-robin.
    pub endpoints: Vec<String>,
    /// Dial attempts per endpoint before moving to the next one.
    pub max_retries: u32,
    /// First-retry backoff; doubles per attempt, with jitter.
    pub backoff_base: Duration,
    /// Deadline for TCP + TLS + WebSocket handshake, per attempt.
    pub dial_timeout: Duration,
    /// Deadline for the subscription ack, per attempt.
    pub ack_timeout: Duration,
    /// Outbound heartbeat period once streaming.
    pub ping_interval: Duration,
    /// Idle read deadline; refreshed by any inbound frame. Expiry counts
    /// as a missed heartbeat.
    pub read_timeout: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(ToString::to_string).collect(),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Deterministic half of the retry backoff: `base · 2^(retry-1)`. Jitter
/// is layered on top at the call site.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << (retry - 1).min(16))
}

/// The feed sends small JSON frames; 64 KiB bounds a misbehaving peer.
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(64 * 1024);
    config
}

/// Why a single connect attempt failed. Internal to the retry loop; the
/// last one is stringified into [`Error::Connect`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum DialError {
    #[error("dial timed out")]
    DialTimeout,
    #[error("subscription ack timed out")]
    AckTimeout,
    #[error("connection closed before ack")]
    StreamEnded,
    #[error("proxy: {0}")]
    Proxy(String),
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Upstream feed client. The pipeline holds it directly; background tasks
/// share the [`Inner`] state behind an `Arc`.
pub struct FeedClient {
    inner: Arc<Inner>,
}

struct Inner {
    opts: FeedOptions,
    /// symbol -> consumer queues. Read on every dispatched tick, written
    /// only by `subscribe`. Never held across an await point.
    handlers: RwLock<HashMap<Symbol, Vec<mpsc::Sender<Tick>>>>,
    /// Round-robin cursor; survives reconnects so a failed endpoint's
    /// successor is tried next.
    next_endpoint: AtomicUsize,
    cancel: CancellationToken,
    metrics: Arc<FeedMetrics>,
}

impl FeedClient {
    /// # Panics
    ///
    /// When `opts.endpoints` is empty.
    #[must_use]
    pub fn new(opts: FeedOptions, cancel: CancellationToken, metrics: Arc<FeedMetrics>) -> Self {
        assert!(
            !opts.endpoints.is_empty(),
            "at least one feed endpoint required"
        );
        Self {
            inner: Arc::new(Inner {
                opts,
                handlers: RwLock::new(HashMap::new()),
                next_endpoint: AtomicUsize::new(0),
                cancel,
                metrics,
            }),
        }
    }

    /// Register a consumer queue for `symbol`. Multiple queues per symbol
    /// are allowed; delivery to each is non-blocking drop-on-full, so no
    /// consumer can block another.
    pub fn subscribe(&self, symbol: Symbol, queue: mpsc::Sender<Tick>) {
        self.inner
            .handlers
            .write()
            .expect("handler lock poisoned")
            .entry(symbol)
            .or_default()
            .push(queue);
    }

    /// Establish a session subscribed to `symbols` and hand it to a
    /// background task.
    ///
    /// # Errors
    ///
    /// [`Error::Connect`] after all endpoints and retries are exhausted,
    /// [`Error::Cancelled`] when shutdown preempts the attempt.
    pub async fn connect(&self, symbols: &[Symbol]) -> Result<(), Error> {
        let ws = self.inner.establish(symbols).await?;
        Inner::spawn_session(&self.inner, ws, symbols.to_vec());
        Ok(())
    }

    /// Tear down the live session and every background task. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    /// One full failover sweep: every endpoint, `max_retries` attempts
    /// each, exponential backoff between attempts.
    async fn establish(&self, symbols: &[Symbol]) -> Result<WsStream, Error> {
        let n = self.opts.endpoints.len();
        let mut attempts = 0u32;
        let mut last = String::from("no attempts made");

        for _ in 0..n {
            let endpoint =
                self.opts.endpoints[self.next_endpoint.fetch_add(1, Relaxed) % n].clone();

            for retry in 0..self.opts.max_retries {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                if retry > 0 {
                    let backoff_ms =
                        backoff_delay(self.opts.backoff_base, retry).as_millis() as u64;
                    let jitter = rand::random::<u64>() % (backoff_ms / 2).max(1);
                    let delay = Duration::from_millis(backoff_ms + jitter);
                    debug!(%endpoint, attempt = retry + 1, ?delay, "backing off before retry");
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }

                attempts += 1;
                match self.try_session(&endpoint, symbols).await {
                    Ok(ws) => {
                        info!(%endpoint, symbols = ?symbols, "feed connected");
                        self.metrics.connected.store(true, Relaxed);
                        return Ok(ws);
                    }
                    Err(e) => {
                        warn!(%endpoint, attempt = retry + 1, error = %e, "connect attempt failed");
                        last = e.to_string();
                    }
                }
            }
        }

        Err(Error::Connect {
            attempts,
            endpoints: n,
            last,
        })
    }

    /// Dial, subscribe, and wait for the ack. Trades racing ahead of the
    /// ack are dispatched, not lost.
    async fn try_session(&self, endpoint: &str, symbols: &[Symbol]) -> Result<WsStream, DialError> {
        let mut ws = timeout(self.opts.dial_timeout, proxy::dial(endpoint))
            .await
            .map_err(|_| DialError::DialTimeout)??;

        let request = binance::subscribe_request(symbols);
        debug!(%endpoint, %request, "subscribing");
        ws.send(Message::Text(request)).await?;

        let deadline = TokioInstant::now() + self.opts.ack_timeout;
        loop {
            let msg = timeout_at(deadline, ws.next())
                .await
                .map_err(|_| DialError::AckTimeout)?
                .ok_or(DialError::StreamEnded)??;

            match msg {
                Message::Text(text) => match binance::classify(&text) {
                    Ok(Frame::Ack { id }) => {
                        info!(%endpoint, ?id, "subscription confirmed");
                        break;
                    }
                    Ok(Frame::Trade(tick)) => self.dispatch(tick),
                    Ok(Frame::Ignored) => debug!("skipping non-trade frame before ack"),
                    Err(e) => {
                        self.metrics.parse_errors.fetch_add(1, Relaxed);
                        warn!(error = %e, "parse error before ack");
                    }
                },
                Message::Ping(payload) => ws.send(Message::Pong(payload)).await?,
                Message::Close(_) => return Err(DialError::StreamEnded),
                _ => {}
            }
        }

        Ok(ws)
    }

    fn spawn_session(inner: &Arc<Self>, ws: WsStream, symbols: Vec<Symbol>) {
        let inner = inner.clone();
        tokio::spawn(async move { inner.run_session(ws, symbols).await });
    }

    /// Drive one live session until shutdown or failure. On failure the
    /// socket is closed and a fresh task restarts the connect lifecycle --
    /// flat supervision, no recursion, no lock held across connect.
    async fn run_session(self: Arc<Self>, mut ws: WsStream, symbols: Vec<Symbol>) {
        let mut heartbeat = interval_at(
            TokioInstant::now() + self.opts.ping_interval,
            self.opts.ping_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("feed client shutting down");
                    self.metrics.connected.store(false, Relaxed);
                    let _ = ws.close(None).await;
                    return;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        warn!(error = %e, "heartbeat write failed");
                        break;
                    }
                }
                msg = timeout(self.opts.read_timeout, ws.next()) => {
                    match msg {
                        Err(_) => {
                            warn!(timeout = ?self.opts.read_timeout, "read deadline exceeded, treating as missed heartbeat");
                            break;
                        }
                        Ok(None) => {
                            warn!("feed stream ended");
                            break;
                        }
                        Ok(Some(Err(e))) => {
                            warn!(error = %e, "feed read error");
                            break;
                        }
                        Ok(Some(Ok(msg))) => {
                            if !self.handle_frame(msg, &mut ws).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.metrics.connected.store(false, Relaxed);
        self.metrics.reconnects.fetch_add(1, Relaxed);
        let _ = ws.close(None).await;

        let inner = self.clone();
        tokio::spawn(async move { inner.resume(symbols).await });
    }

    /// Process one inbound frame; `false` means the connection must be
    /// abandoned.
    async fn handle_frame(&self, msg: Message, ws: &mut WsStream) -> bool {
        match msg {
            Message::Text(text) => {
                self.metrics.frames.fetch_add(1, Relaxed);
                let t0 = Instant::now();
                match binance::classify(&text) {
                    Ok(Frame::Trade(tick)) => {
                        self.metrics.decode_latency.record(t0.elapsed());
                        self.dispatch(tick);
                    }
                    Ok(Frame::Ack { id }) => info!(?id, "subscription confirmed"),
                    Ok(Frame::Ignored) => debug!("skipping non-trade frame"),
                    Err(e) => {
                        self.metrics.parse_errors.fetch_add(1, Relaxed);
                        warn!(error = %e, "dropping unparseable frame");
                    }
                }
                true
            }
            Message::Ping(payload) => ws.send(Message::Pong(payload)).await.is_ok(),
            // Any inbound frame, this one included, already refreshed the
            // read deadline.
            Message::Pong(_) => true,
            Message::Close(frame) => {
                warn!(?frame, "feed closed the connection");
                false
            }
            _ => true,
        }
    }

    /// Reconnect supervisor: repeat full failover sweeps until a session
    /// is live again or shutdown wins.
    async fn resume(self: Arc<Self>, symbols: Vec<Symbol>) {
        loop {
            match self.establish(&symbols).await {
                Ok(ws) => {
                    Self::spawn_session(&self, ws, symbols);
                    return;
                }
                Err(Error::Cancelled) => return,
                Err(e) => {
                    error!(error = %e, "reconnect sweep failed, retrying");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(self.opts.backoff_base) => {}
                    }
                }
            }
        }
    }

    /// Non-blocking fan-out to every consumer queue for the tick's symbol.
    fn dispatch(&self, tick: Tick) {
        let handlers = self.handlers.read().expect("handler lock poisoned");
        let Some(queues) = handlers.get(&tick.symbol) else {
            debug!(symbol = %tick.symbol, "no consumers registered");
            return;
        };
        for queue in queues {
            match queue.try_send(tick.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.ticks_dropped.fetch_add(1, Relaxed);
                    warn!(symbol = %tick.symbol, "consumer queue full, dropping tick");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(symbol = %tick.symbol, "consumer queue closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::testutil::tick;

    fn client() -> FeedClient {
        FeedClient::new(
            FeedOptions::default(),
            CancellationToken::new(),
            Metrics::register().feed(),
        )
    }

    #[test]
    fn default_options_carry_three_failover_endpoints() {
        let opts = FeedOptions::default();
        assert_eq!(opts.endpoints.len(), 3);
        assert!(opts.endpoints.iter().all(|e| e.starts_with("wss://")));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
    }

    #[test]
    fn dispatch_preserves_order_and_reaches_all_queues() {
        let c = client();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        c.subscribe(Symbol::from("BTCUSDT"), tx_a);
        c.subscribe(Symbol::from("BTCUSDT"), tx_b);

        for i in 0..3 {
            c.inner.dispatch(tick("BTCUSDT", 100.0 + f64::from(i), 1.0, i64::from(i)));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let ts: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
                .map(|t| t.timestamp)
                .collect();
            assert_eq!(ts, vec![0, 1, 2]);
        }
    }

    #[test]
    fn full_queue_drops_tick_for_that_consumer_only() {
        let c = client();
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        c.subscribe(Symbol::from("BTCUSDT"), tx_slow);
        c.subscribe(Symbol::from("BTCUSDT"), tx_fast);

        for i in 0..3 {
            c.inner.dispatch(tick("BTCUSDT", 100.0, 1.0, i));
        }

        // Slow queue holds only the first tick; fast queue got all three.
        assert_eq!(rx_slow.try_recv().unwrap().timestamp, 0);
        assert!(rx_slow.try_recv().is_err());
        let fast: Vec<i64> = std::iter::from_fn(|| rx_fast.try_recv().ok())
            .map(|t| t.timestamp)
            .collect();
        assert_eq!(fast, vec![0, 1, 2]);
        assert_eq!(
            c.inner.metrics.ticks_dropped.load(Relaxed),
            2,
            "two drops recorded for the slow consumer"
        );
    }

    #[test]
    fn dispatch_without_consumers_is_a_no_op() {
        let c = client();
        c.inner.dispatch(tick("ETHUSDT", 1.0, 1.0, 0));
    }

    #[test]
    fn close_is_idempotent() {
        let c = client();
        c.close();
        c.close();
        assert!(c.inner.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn connect_fails_fast_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let c = FeedClient::new(
            FeedOptions {
                endpoints: vec!["ws://127.0.0.1:1".into()],
                ..FeedOptions::default()
            },
            cancel,
            Metrics::register().feed(),
        );
        let err = c.connect(&[Symbol::from("BTCUSDT")]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn connect_exhausts_unreachable_endpoints() {
        // Port 1 refuses immediately, so this exercises the full sweep
        // without waiting on network timeouts.
        let c = FeedClient::new(
            FeedOptions {
                endpoints: vec!["ws://127.0.0.1:1".into()],
                max_retries: 2,
                backoff_base: Duration::from_millis(1),
                dial_timeout: Duration::from_millis(500),
                ..FeedOptions::default()
            },
            CancellationToken::new(),
            Metrics::register().feed(),
        );
        let err = c.connect(&[Symbol::from("BTCUSDT")]).await.unwrap_err();
        match err {
            Error::Connect { attempts, endpoints, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(endpoints, 1);
            }
            other => panic!("expected Connect error, got {other}"),
        }
    }
}
