//! The client Upgrade handshake (RFC 6455 section 4): builds the opening
//! request, reads the server's response head, and validates it — status,
//! `Upgrade`/`Connection`, `Sec-WebSocket-Accept`, and extension selection.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{Error, HandshakeError};
use crate::extensions::{ExtensionBuilder, ExtensionOffer, ExtensionPipeline};
use crate::url::WsUrl;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEAD_BYTES: usize = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

/// The value `Sec-WebSocket-Accept` must carry for a given client key, per
/// RFC 6455 section 4.2.2: `base64(SHA1(key + GUID))`. Mirrors the
/// hex round trip the teacher's handshake uses to turn a hex digest back
/// into raw bytes before re-encoding.
pub fn expected_accept(key: &str) -> String {
    let mut concatenated = String::with_capacity(key.len() + GUID.len());
    concatenated.push_str(key);
    concatenated.push_str(GUID);
    let hex_digest = sha1_smol::Sha1::from(concatenated).digest().to_string();
    let raw = hex::decode(hex_digest).expect("sha1 hexdigest is always valid hex");
    STANDARD.encode(raw)
}

/// Builds the client's Upgrade request. Header order matches spec §4.1/§6
/// exactly; `additional_headers` are appended last and never override the
/// required set.
pub fn build_request(
    url: &WsUrl,
    key: &str,
    extension_builders: &[Box<dyn ExtensionBuilder>],
    additional_headers: &[(String, String)],
) -> Vec<u8> {
    let mut req = String::new();
    req.push_str(&format!("GET {} HTTP/1.1\r\n", url.path_and_query));
    req.push_str(&format!("Host: {}\r\n", url.host_header()));
    req.push_str(&format!("Origin: {}\r\n", url.origin()));
    req.push_str("Connection: upgrade\r\n");
    req.push_str("Upgrade: websocket\r\n");
    req.push_str("Sec-WebSocket-Version: 13\r\n");
    req.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));

    for builder in extension_builders {
        if let Some(offer) = builder.offer_header_value() {
            req.push_str(&format!("Sec-WebSocket-Extensions: {offer}\r\n"));
        }
    }

    for (name, value) in additional_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }

    req.push_str("\r\n");
    req.into_bytes()
}

/// Parses one `Sec-WebSocket-Extensions` header value: comma-separated
/// offers, each `;`-separated into a name and optional `key` / `key=value`
/// parameters.
pub fn parse_extensions_header(value: &str) -> Vec<ExtensionOffer> {
    value
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';').map(str::trim).filter(|s| !s.is_empty());
            let name = parts.next()?.to_string();
            let params = parts
                .map(|param| match param.split_once('=') {
                    Some((k, v)) => (k.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
                    None => (param.trim().to_string(), None),
                })
                .collect();
            Some(ExtensionOffer { name, params })
        })
        .collect()
}

/// The outcome of a successful handshake: the negotiated extension pipeline
/// and any bytes read past the response head (a server may pack the first
/// WebSocket frame into the same TCP segment as the 101 response).
pub struct HandshakeOutcome {
    pub pipeline: ExtensionPipeline,
    pub trailing_bytes: Vec<u8>,
}

/// Runs the full client handshake over an already-connected stream (i.e.
/// after any proxy CONNECT tunnel has completed).
pub async fn perform_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    url: &WsUrl,
    extension_builders: Vec<Box<dyn ExtensionBuilder>>,
    additional_headers: &[(String, String)],
) -> Result<HandshakeOutcome, Error> {
    let key = generate_key();
    let request = build_request(url, &key, &extension_builders, additional_headers);
    trace!(bytes = request.len(), "sending websocket upgrade request");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let (head, trailing_bytes) = read_response_head(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    response.parse(&head).map_err(HandshakeError::from)?;

    let status = response.code.ok_or_else(|| HandshakeError::MalformedResponse("missing status code".into()))?;
    if status != 101 {
        return Err(HandshakeError::UnexpectedStatus(status).into());
    }

    let header_value = |name: &str| -> Option<&str> {
        response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
    };

    let upgrade = header_value("Upgrade").ok_or(HandshakeError::MissingUpgradeHeader)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::MissingUpgradeHeader.into());
    }

    let connection = header_value("Connection").ok_or(HandshakeError::MissingConnectionHeader)?;
    if !connection.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "upgrade") {
        return Err(HandshakeError::MissingConnectionHeader.into());
    }

    let accept = header_value("Sec-WebSocket-Accept").ok_or(HandshakeError::AcceptMismatch)?;
    if accept != expected_accept(&key) {
        return Err(HandshakeError::AcceptMismatch.into());
    }

    let offers: Vec<ExtensionOffer> = response
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Extensions"))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
        .flat_map(parse_extensions_header)
        .collect();

    let mut active = Vec::new();
    for builder in &extension_builders {
        let matched = offers.iter().find(|o| o.name.eq_ignore_ascii_case(builder.name()));
        if !builder.is_negotiated() || matched.is_some() {
            if let Some(ext) = builder.build(matched)? {
                debug!(extension = ext.name(), "extension active");
                active.push(ext);
            }
        }
    }

    debug!(status, extensions = active.len(), "websocket upgrade complete");
    Ok(HandshakeOutcome { pipeline: ExtensionPipeline::new(active), trailing_bytes })
}

/// Reads from `stream` until a blank line terminates the HTTP response
/// head, returning the head bytes (including the terminating `\r\n\r\n`)
/// and any bytes read past it.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        if let Some(pos) = find_header_terminator(&buf) {
            let trailing = buf.split_off(pos);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(HandshakeError::HeadersTooLarge.into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::MalformedResponse("connection closed before response head completed".into()).into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_hash_matches_rfc_example() {
        assert_eq!(expected_accept("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn request_matches_exact_header_order() {
        let url = WsUrl::parse("ws://host:8080/ws").unwrap();
        let request = build_request(&url, "dGhlIHNhbXBsZSBub25jZQ==", &[], &[]);
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with(
            "GET /ws HTTP/1.1\r\n\
             Host: host:8080\r\n\
             Origin: ws://host\r\n\
             Connection: upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"
        ));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn additional_headers_are_appended_after_required_ones() {
        let url = WsUrl::parse("ws://host/ws").unwrap();
        let extra = vec![("X-Custom".to_string(), "value".to_string())];
        let request = build_request(&url, "key", &[], &extra);
        let text = String::from_utf8(request).unwrap();
        let key_pos = text.find("Sec-WebSocket-Key").unwrap();
        let custom_pos = text.find("X-Custom").unwrap();
        assert!(custom_pos > key_pos);
    }

    #[test]
    fn parses_extension_offer_with_parameters() {
        let offers = parse_extensions_header("permessage-deflate; client_max_window_bits=12; server_no_context_takeover");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert_eq!(offers[0].params[0], ("client_max_window_bits".to_string(), Some("12".to_string())));
        assert_eq!(offers[0].params[1], ("server_no_context_takeover".to_string(), None));
    }

    #[test]
    fn parses_multiple_comma_separated_offers() {
        let offers = parse_extensions_header("foo; a=1, bar");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].name, "foo");
        assert_eq!(offers[1].name, "bar");
    }

    #[tokio::test]
    async fn performs_handshake_against_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8(buf[..n].to_vec()).unwrap();
            let key_line = request.lines().find(|l| l.starts_with("Sec-WebSocket-Key")).unwrap();
            let key = key_line.split(": ").nth(1).unwrap().trim();
            let accept = expected_accept(key);
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\nTRAILING"
            );
            server.write_all(response.as_bytes()).await.unwrap();
        });

        let url = WsUrl::parse("ws://example.com/ws").unwrap();
        let outcome = perform_handshake(&mut client, &url, Vec::new(), &[]).await.unwrap();
        assert!(outcome.pipeline.is_empty());
        assert_eq!(outcome.trailing_bytes, b"TRAILING");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_101_status() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
        });

        let url = WsUrl::parse("ws://example.com/ws").unwrap();
        let result = perform_handshake(&mut client, &url, Vec::new(), &[]).await;
        let err = match result {
            Ok(_) => panic!("expected handshake to fail on a non-101 status"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Handshake(HandshakeError::UnexpectedStatus(400))));
    }
}
