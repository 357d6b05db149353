//! Minimal `ws://`/`wss://` URL decomposition, built on the `url` crate.
//! Only what the handshake needs — full URL semantics (userinfo, fragments,
//! IDNA) are out of scope.

use crate::error::HandshakeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsScheme {
    Ws,
    Wss,
}

impl WsScheme {
    pub fn is_tls(self) -> bool {
        matches!(self, WsScheme::Wss)
    }

    pub fn default_port(self) -> u16 {
        match self {
            WsScheme::Ws => 80,
            WsScheme::Wss => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WsScheme::Ws => "ws",
            WsScheme::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsUrl {
    pub scheme: WsScheme,
    pub host: String,
    pub port: u16,
    /// Whether the original URL text carried an explicit port; affects
    /// whether the `Host` header includes one.
    explicit_port: bool,
    pub path_and_query: String,
}

impl WsUrl {
    pub fn parse(raw: &str) -> Result<WsUrl, HandshakeError> {
        let parsed = url::Url::parse(raw).map_err(|e| HandshakeError::InvalidUrl(e.to_string()))?;

        let scheme = match parsed.scheme() {
            "ws" => WsScheme::Ws,
            "wss" => WsScheme::Wss,
            other => return Err(HandshakeError::InvalidUrl(format!("unsupported scheme: {other}"))),
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| HandshakeError::InvalidUrl("missing host".into()))?
            .to_string();

        let explicit_port = parsed.port().is_some();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let mut path_and_query = if parsed.path().is_empty() { "/".to_string() } else { parsed.path().to_string() };
        if let Some(q) = parsed.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }

        Ok(WsUrl { scheme, host, port, explicit_port, path_and_query })
    }

    /// `host[:port]`, per the `Host` header rule in spec §4.1: the port is
    /// included only if the URL text carried one explicitly.
    pub fn host_header(&self) -> String {
        if self.explicit_port {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }

    /// `scheme://host`, with no port, for the `Origin` header.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.host)
    }
}
