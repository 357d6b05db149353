//! A WebSocket (RFC 6455) client protocol core with permessage-deflate
//! (RFC 7692) support: the Upgrade handshake, frame codec, extension
//! negotiation, connection state machine, message reassembly, and an HTTP
//! CONNECT proxy handshake, layered over any `AsyncRead + AsyncWrite`
//! stream the caller already established.
//!
//! TLS session setup, DNS resolution policy, and SOCKS proxy byte-level
//! negotiation are not this crate's job: [`connect`] dials a plain TCP
//! stream for `ws://`, and [`connect_on`] accepts any stream already in
//! place — including one wrapped in TLS for `wss://`.

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod proxy;
pub mod state;
pub mod url;
pub mod utf8;

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

pub use close::{CloseCode, CloseFrame};
pub use config::ClientConfig;
pub use connection::{Inbox, Sender};
pub use error::Error;
pub use message::Message;
pub use url::WsUrl;

/// Connects to `url` over a plain TCP stream and runs `handler` until it
/// returns or the connection closes. `url` must be `ws://`; for `wss://`,
/// establish your own TLS stream and call [`connect_on`].
pub async fn connect<F, Fut>(url: &str, config: ClientConfig, handler: F) -> Result<Option<CloseFrame>, Error>
where
    F: FnOnce(Sender, Inbox) -> Fut,
    Fut: Future<Output = ()>,
{
    let parsed = WsUrl::parse(url)?;
    if parsed.scheme.is_tls() {
        return Err(error::HandshakeError::InvalidUrl(
            "wss:// requires a caller-supplied TLS stream; use connect_on".into(),
        )
        .into());
    }

    let proxy = config.resolve_proxy(&parsed);
    let (dial_host, dial_port) = match &proxy {
        Some(p) => (p.host.as_str(), p.port),
        None => (parsed.host.as_str(), parsed.port),
    };

    debug!(host = dial_host, port = dial_port, "dialing websocket peer");
    let stream = TcpStream::connect((dial_host, dial_port)).await?;
    run_handshake_and_connection(stream, &parsed, proxy, config, handler).await
}

/// Runs the handshake (through a proxy tunnel if configured) and the
/// connection over an already-established duplex stream.
pub async fn connect_on<S, F, Fut>(stream: S, url: &str, config: ClientConfig, handler: F) -> Result<Option<CloseFrame>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Sender, Inbox) -> Fut,
    Fut: Future<Output = ()>,
{
    let parsed = WsUrl::parse(url)?;
    let proxy = config.resolve_proxy(&parsed);
    run_handshake_and_connection(stream, &parsed, proxy, config, handler).await
}

async fn run_handshake_and_connection<S, F, Fut>(
    mut stream: S,
    url: &WsUrl,
    proxy: Option<config::ProxyConfig>,
    mut config: ClientConfig,
    handler: F,
) -> Result<Option<CloseFrame>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Sender, Inbox) -> Fut,
    Fut: Future<Output = ()>,
{
    if let Some(proxy) = &proxy {
        proxy::negotiate_connect_tunnel(&mut stream, &url.host, url.port, &proxy.headers, config.close_timeout).await?;
    }

    let extension_builders = std::mem::take(&mut config.extensions);
    let outcome = handshake::perform_handshake(&mut stream, url, extension_builders, &config.additional_headers).await?;

    connection::run(stream, &config, outcome.pipeline, outcome.trailing_bytes, handler).await
}
