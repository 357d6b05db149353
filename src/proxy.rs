//! HTTP CONNECT proxy tunnel negotiation (spec's proxy handshake): run
//! before the WebSocket Upgrade whenever a proxy is configured. Once this
//! completes, the same byte stream carries the ordinary handshake.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, ProxyError};

const MAX_RESPONSE_HEAD_BYTES: usize = 8 * 1024;

/// Negotiates a CONNECT tunnel to `target_host:target_port` over `stream`,
/// which must already be connected to the proxy itself. On success the
/// stream is ready for the WebSocket Upgrade request.
pub async fn negotiate_connect_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    headers: &[(String, String)],
    deadline: Duration,
) -> Result<(), Error> {
    match timeout(deadline, run(stream, target_host, target_port, headers)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout.into()),
    }
}

async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    headers: &[(String, String)],
) -> Result<(), Error> {
    let mut request = format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    debug!(target_host, target_port, "sending proxy CONNECT");
    stream.write_all(request.as_bytes()).await.map_err(remap_broken_pipe)?;
    stream.flush().await.map_err(remap_broken_pipe)?;

    let (head, trailing) = read_response_head(stream).await?;
    let status = parse_status_line(&head)?;

    match status {
        200..=299 => debug!(status, "proxy tunnel established"),
        407 => {
            warn!("proxy requires authentication");
            return Err(ProxyError::AuthenticationRequired.into());
        }
        other => {
            warn!(status = other, "proxy returned an unexpected status");
            return Err(ProxyError::InvalidResponseHead(other).into());
        }
    }

    if !trailing.is_empty() {
        return Err(ProxyError::InvalidResponse.into());
    }

    Ok(())
}

/// `tokio::io::duplex` (and real sockets) surface a dropped peer as a
/// broken-pipe write failure; treat that the same as the peer closing
/// before sending a response head.
fn remap_broken_pipe(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        ProxyError::RemoteConnectionClosed.into()
    } else {
        e.into()
    }
}

async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let trailing = buf.split_off(pos + 4);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(ProxyError::InvalidResponse.into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::RemoteConnectionClosed.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_status_line(head: &[u8]) -> Result<u16, Error> {
    let line_end = head.iter().position(|&b| b == b'\r').unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| ProxyError::InvalidResponse)?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(ProxyError::InvalidResponse)?;
    Ok(status)
}
