//! Service configuration via clap, with environment fallbacks.
//!
//! `ENV` names the profile (default `dev`) and picks the default database
//! file; `OHLC_SERVICE_ADDR` overrides the gRPC listen address. Everything
//! else is a flag with a sensible default.

use std::time::Duration;

use clap::Parser;

use crate::ingest::FeedOptions;
use crate::types::Symbol;

#[derive(Parser, Debug, Clone)]
#[command(name = "ohlc-stream")]
#[command(
    about = "Ingests exchange aggregate trades, folds them into OHLC candlesticks, and streams closed candles via gRPC"
)]
pub struct Config {
    /// Trading pair symbols to ingest (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,PEPEUSDT")]
    pub symbols: Vec<String>,

    /// Candlestick window length in seconds
    #[arg(long, default_value_t = 10)]
    pub interval_secs: u64,

    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:50051")]
    pub addr: String,

    /// Metrics/health HTTP port
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// SQLite database path (default: ohlc-<profile>.db)
    #[arg(long)]
    pub db_path: Option<String>,

    /// Upstream feed endpoint, repeatable (default: the Binance failover set)
    #[arg(long = "endpoint")]
    pub endpoints: Vec<String>,

    /// Maximum concurrently registered subscriber queues
    #[arg(long, default_value_t = 100)]
    pub max_subscribers: usize,

    /// Capacity of the tick queue and each subscriber queue
    #[arg(long, default_value_t = 1000)]
    pub channel_size: usize,

    /// Shutdown drain deadline in seconds
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Parse flags and apply environment overrides.
    #[must_use]
    pub fn load() -> Self {
        let mut config = Self::parse();
        if let Some(addr) = env_str("OHLC_SERVICE_ADDR") {
            config.addr = addr;
        }
        if let Some(db_path) = env_str("OHLC_DB_PATH") {
            config.db_path = Some(db_path);
        }
        config
    }

    /// Configuration profile from `ENV`, default `dev`.
    #[must_use]
    pub fn profile() -> String {
        env_str("ENV").unwrap_or_else(|| "dev".to_string())
    }

    #[must_use]
    pub fn db_path(&self) -> String {
        self.db_path
            .clone()
            .unwrap_or_else(|| format!("ohlc-{}.db", Self::profile()))
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }

    /// Feed options with any `--endpoint` overrides applied.
    #[must_use]
    pub fn feed_options(&self) -> FeedOptions {
        let mut opts = FeedOptions::default();
        if !self.endpoints.is_empty() {
            opts.endpoints = self.endpoints.clone();
        }
        opts
    }
}
