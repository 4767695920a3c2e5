//! Demo gRPC client for the OHLC stream service.
//!
//! Subscribes to the given symbols and prints each closed candle as it
//! arrives.
//!
//! ```bash
//! cargo run --release --bin client                              # localhost, default symbols
//! cargo run --release --bin client -- http://server:50051 BTCUSDT ETHUSDT
//! ```

use tonic::Request;

#[allow(clippy::pedantic)] // Generated code.
pub mod proto {
    tonic::include_proto!("ohlc");
}

use proto::ohlc_service_client::OhlcServiceClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1).peekable();

    let addr = match args.peek() {
        Some(a) if a.starts_with("http") => args.next().unwrap_or_default(),
        _ => "http://localhost:50051".to_string(),
    };
    let mut symbols: Vec<String> = args.collect();
    if symbols.is_empty() {
        symbols = vec!["BTCUSDT".into(), "ETHUSDT".into(), "PEPEUSDT".into()];
    }

    println!("connecting to {addr}, symbols: {symbols:?}...");

    let mut client = OhlcServiceClient::connect(addr).await?;
    let mut stream = client
        .stream_ohlc(Request::new(proto::SubscribeRequest { symbols }))
        .await?
        .into_inner();

    println!("streaming closed candles (ctrl+c to stop)\n");
    println!(
        "{:<10} {:>12} {:>12} {:>12} {:>12} {:>14} {:>15}",
        "SYMBOL", "OPEN", "HIGH", "LOW", "CLOSE", "VOLUME", "OPEN TIME"
    );

    while let Some(candle) = stream.message().await? {
        println!(
            "{:<10} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>14.6} {:>15}",
            candle.symbol,
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume,
            candle.open_time
        );
    }

    Ok(())
}
