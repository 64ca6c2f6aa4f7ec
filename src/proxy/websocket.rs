//! Raw WebSocket upgrade passthrough.
//!
//! No Rust reverse-proxy library ships request rewrite + response modify +
//! error hook + WebSocket passthrough as one package the way a batteries-
//! included host library would, so the upgrade path follows the fallback
//! the design notes prescribe: dial the upstream with a raw TCP stream,
//! replay the request line and handshake headers by hand, wait for the
//! upstream's `101 Switching Protocols`, then copy bytes bidirectionally
//! until either side closes.

use crate::error::{FinGuardError, Result};
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Headers forwarded verbatim on a WebSocket upgrade, beyond the standard
/// `Upgrade`/`Connection` pair.
fn is_handshake_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "upgrade"
        || lower == "connection"
        || lower == "host"
        || lower.starts_with("sec-websocket-")
}

/// Build the raw HTTP/1.1 request line + headers to replay to the upstream.
fn build_handshake_request(req: &Request<Body>, upstream_authority: &str, upstream_host: &str) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = format!("GET {} HTTP/1.1\r\n", path);
    out.push_str(&format!("Host: {}\r\n", upstream_host));

    for (name, value) in req.headers() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if is_handshake_header(name.as_str()) {
            if let Ok(v) = value.to_str() {
                out.push_str(&format!("{}: {}\r\n", name.as_str(), v));
            }
        }
    }

    for header in ["X-Real-IP", "X-Forwarded-For", "X-Forwarded-Proto", "X-Forwarded-Host"] {
        if let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) {
            out.push_str(&format!("{}: {}\r\n", header, value));
        }
    }

    let _ = upstream_authority;
    out.push_str("\r\n");
    out
}

/// Read the upstream's HTTP/1.1 status line + headers, stopping at the
/// blank line that ends the header block. Returns the parsed status code
/// and the raw header block (so its headers can be echoed back to the
/// client untouched, e.g. `Sec-WebSocket-Accept`).
async fn read_handshake_response(stream: &mut TcpStream) -> Result<(u16, String)> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| FinGuardError::UpstreamFault(format!("reading handshake response: {}", e)))?;
        if n == 0 {
            return Err(FinGuardError::UpstreamFault(
                "upstream closed connection during websocket handshake".to_string(),
            ));
        }
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(FinGuardError::UpstreamFault(
                "upstream handshake response exceeded header size limit".to_string(),
            ));
        }
    }

    let text = String::from_utf8_lossy(&buf).into_owned();
    let status_line = text.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FinGuardError::UpstreamFault(format!("malformed status line: {}", status_line)))?;

    Ok((status, text))
}

/// Handle a WebSocket-upgrade request: proxy the handshake to `upstream`,
/// and on success return a `101` to the caller whose `on_upgrade` future
/// spawns the bidirectional byte-copy once the client side also upgrades.
pub async fn proxy_upgrade(
    mut req: Request<Body>,
    upstream_authority: String,
    upstream_host: String,
) -> std::result::Result<Response<Body>, StatusCode> {
    let handshake = build_handshake_request(&req, &upstream_authority, &upstream_host);

    let mut upstream = match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&upstream_authority)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(upstream = %upstream_authority, error = %e, "websocket upstream dial failed");
            return Err(StatusCode::BAD_GATEWAY);
        }
        Err(_) => {
            warn!(upstream = %upstream_authority, "websocket upstream dial timed out");
            return Err(StatusCode::GATEWAY_TIMEOUT);
        }
    };

    if let Err(e) = upstream.write_all(handshake.as_bytes()).await {
        warn!(upstream = %upstream_authority, error = %e, "failed to send websocket handshake upstream");
        return Err(StatusCode::BAD_GATEWAY);
    }

    let (status, raw_headers) =
        match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read_handshake_response(&mut upstream)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(upstream = %upstream_authority, error = %e, "websocket handshake response read failed");
                return Err(StatusCode::BAD_GATEWAY);
            }
            Err(_) => {
                warn!(upstream = %upstream_authority, "websocket handshake response timed out");
                return Err(StatusCode::GATEWAY_TIMEOUT);
            }
        };

    if status != 101 {
        debug!(upstream = %upstream_authority, status, "upstream declined websocket upgrade");
        return Err(StatusCode::BAD_GATEWAY);
    }

    let on_upgrade = hyper::upgrade::on(&mut req);

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for line in raw_headers.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            response = response.header(name.trim(), value.trim());
        }
    }
    let response = response
        .body(Body::empty())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(to_upstream, to_client, "websocket session closed");
                    }
                    Err(e) => {
                        debug!(error = %e, "websocket byte-copy ended");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "client websocket upgrade failed after upstream accepted");
            }
        }
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_handshake_headers() {
        assert!(is_handshake_header("Sec-WebSocket-Key"));
        assert!(is_handshake_header("Sec-WebSocket-Version"));
        assert!(is_handshake_header("Upgrade"));
        assert!(is_handshake_header("Connection"));
        assert!(!is_handshake_header("X-Custom"));
    }
}
