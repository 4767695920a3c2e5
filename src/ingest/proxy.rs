//! Optional HTTP CONNECT bootstrap for the upstream WebSocket.
//!
//! Honors the conventional `https_proxy`/`HTTPS_PROXY` (and `http_proxy`)
//! environment variables. Without a proxy configured, the dial is a direct
//! TLS connect.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{client_async_tls_with_config, connect_async_tls_with_config};
use url::Url;

use super::{ws_config, DialError, WsStream};

/// Dial `endpoint`, tunneling through the environment-configured proxy
/// when one is set.
pub(crate) async fn dial(endpoint: &str) -> Result<WsStream, DialError> {
    match proxy_from_env() {
        None => {
            let (ws, _) =
                connect_async_tls_with_config(endpoint, Some(ws_config()), true, None).await?;
            Ok(ws)
        }
        Some(proxy) => {
            let tunnel = connect_tunnel(&proxy, endpoint).await?;
            let (ws, _) =
                client_async_tls_with_config(endpoint, tunnel, Some(ws_config()), None).await?;
            Ok(ws)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

/// First conventional proxy variable that is set, non-empty, and parseable.
pub(crate) fn proxy_from_env() -> Option<ProxyAddr> {
    ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        .and_then(|raw| parse_proxy(&raw))
}

/// Accepts `http://host:port`, `host:port`, or a bare `host` (port 80).
pub(crate) fn parse_proxy(raw: &str) -> Option<ProxyAddr> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(80);
    Some(ProxyAddr { host, port })
}

/// Establish the raw tunnel: TCP to the proxy, `CONNECT host:port`, then
/// hand the stream back for the TLS + WebSocket handshake.
async fn connect_tunnel(proxy: &ProxyAddr, endpoint: &str) -> Result<TcpStream, DialError> {
    let target = Url::parse(endpoint)?;
    let host = target
        .host_str()
        .ok_or_else(|| DialError::Proxy("endpoint has no host".into()))?;
    let port = target.port().unwrap_or(match target.scheme() {
        "wss" => 443,
        _ => 80,
    });

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read response headers byte-wise until the blank line; the tunnel
    // payload that follows belongs to the TLS handshake.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 4096 {
            return Err(DialError::Proxy("oversized CONNECT response".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::Proxy("proxy closed during CONNECT".into()));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status = head.lines().next().unwrap_or_default();
    if !status.contains(" 200") {
        return Err(DialError::Proxy(format!("CONNECT refused: {status}")));
    }
    Ok(stream)
}
