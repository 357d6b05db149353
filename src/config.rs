//! The client configuration surface: every option named in spec §6,
//! centralized as one builder-friendly type rather than scattered
//! parameters, the way `rustapi-ws` centralizes its heartbeat/compression
//! config structs.

use std::env;
use std::time::Duration;

use crate::extensions::deflate::{PerMessageDeflateBuilder, PerMessageDeflateConfig};
use crate::extensions::ExtensionBuilder;
use crate::url::{WsScheme, WsUrl};

/// An HTTP CONNECT proxy to tunnel the connection through. SOCKS proxies
/// remain a non-goal of this core.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub headers: Vec<(String, String)>,
}

pub struct ClientConfig {
    /// Rejects inbound frames over this size. Default 16 384 bytes.
    pub max_frame_size: usize,
    /// Rejects reassembled messages (across all fragments) over this size.
    pub max_message_size: usize,
    /// Merged into the Upgrade request, after the required headers.
    pub additional_headers: Vec<(String, String)>,
    /// Ordered extension builders; permessage-deflate is included by
    /// default via [`ClientConfig::default`].
    pub extensions: Vec<Box<dyn ExtensionBuilder>>,
    /// Max wait for the peer's close echo. Default 15s.
    pub close_timeout: Duration,
    /// Period for idle pings; `None` disables auto-ping (the default).
    pub auto_ping: Option<Duration>,
    /// Validate text message UTF-8. Default false.
    pub validate_utf8: bool,
    /// Hostname to present in TLS SNI, overriding the URL host. The core
    /// does not perform TLS itself; this is handed to the caller's stream
    /// constructor.
    pub sni_hostname: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// Honor `http_proxy` / `https_proxy` / `no_proxy` environment
    /// variables when `proxy` is unset. Default false.
    pub read_proxy_environment_variables: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_frame_size: 16 * 1024,
            max_message_size: 16 * 1024 * 1024,
            additional_headers: Vec::new(),
            extensions: vec![Box::new(PerMessageDeflateBuilder::new(PerMessageDeflateConfig::default()))],
            close_timeout: Duration::from_secs(15),
            auto_ping: None,
            validate_utf8: false,
            sni_hostname: None,
            proxy: None,
            read_proxy_environment_variables: false,
        }
    }
}

impl ClientConfig {
    /// Resolves the proxy to use for `url`: the explicit `proxy` field if
    /// set, otherwise the environment variables if enabled and not
    /// overridden by `no_proxy`.
    pub fn resolve_proxy(&self, url: &WsUrl) -> Option<ProxyConfig> {
        if self.proxy.is_some() {
            return self.proxy.clone();
        }
        if !self.read_proxy_environment_variables {
            return None;
        }
        resolve_proxy_from_environment(url)
    }
}

/// Implements spec §6/§9's `no_proxy` matching: comma- or
/// whitespace-separated entries, trimmed; a leading `.` matches both the
/// bare domain and its subdomains; `*` disables proxying entirely.
/// Preserved exactly as described — no stricter semantics guessed.
pub struct NoProxyMatcher {
    entries: Vec<String>,
    disable_all: bool,
}

impl NoProxyMatcher {
    pub fn parse(raw: &str) -> Self {
        let mut entries = Vec::new();
        let mut disable_all = false;
        for entry in raw.split(|c: char| c == ',' || c.is_whitespace()) {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "*" {
                disable_all = true;
                continue;
            }
            entries.push(trimmed.trim_start_matches('.').to_ascii_lowercase());
        }
        NoProxyMatcher { entries, disable_all }
    }

    /// Whether `host` should bypass the proxy.
    pub fn matches(&self, host: &str) -> bool {
        if self.disable_all {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.entries.iter().any(|entry| host == *entry || host.ends_with(&format!(".{entry}")))
    }
}

fn resolve_proxy_from_environment(url: &WsUrl) -> Option<ProxyConfig> {
    let no_proxy = env::var("no_proxy").or_else(|_| env::var("NO_PROXY")).ok();
    if let Some(no_proxy) = &no_proxy {
        if NoProxyMatcher::parse(no_proxy).matches(&url.host) {
            return None;
        }
    }

    let raw = match url.scheme {
        WsScheme::Wss => env::var("https_proxy")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .or_else(|_| env::var("http_proxy"))
            .ok()?,
        WsScheme::Ws => env::var("http_proxy").ok()?,
    };

    let parsed = url::Url::parse(&raw).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some(ProxyConfig { host, port, headers: Vec::new() })
}
