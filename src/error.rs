//! Error taxonomy for the WebSocket client core.
//!
//! Mirrors the classification in the protocol design: protocol errors map to
//! close code 1002, data errors to 1007/1009, and so on. `close_code` is how
//! the connection state machine decides what to put in an outgoing close
//! frame when a local error forces the connection shut.

use std::io;

use crate::close::CloseCode;

/// Errors surfaced while establishing or running a WebSocket connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed frame, bad opcode, or other RFC 6455 framing violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Text message failed UTF-8 validation.
    #[error("invalid utf-8 in text message")]
    InvalidUtf8,

    /// A message or frame exceeded a configured size limit.
    #[error("message exceeded maximum size of {limit} bytes")]
    MessageTooLarge { limit: usize },

    /// permessage-deflate inflate/deflate failure.
    #[error("extension error: {0}")]
    Extension(String),

    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// No pong within a ping period, or peer did not echo close in time.
    #[error("{0}")]
    Timeout(&'static str),

    /// Failures establishing the connection before the user handler runs.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Failures negotiating an HTTP CONNECT proxy tunnel.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// The connection is already closing/closed; the write was rejected.
    #[error("write rejected: connection is closing")]
    Closing,
}

impl Error {
    /// The close code that should be reported to the peer for this error, if
    /// the connection is still in a state where a close frame can be sent.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(ProtocolError::FrameTooLarge) => Some(CloseCode::MessageTooLarge),
            Error::Protocol(_) => Some(CloseCode::ProtocolError),
            Error::InvalidUtf8 => Some(CloseCode::DataInconsistentWithType),
            Error::MessageTooLarge { .. } => Some(CloseCode::MessageTooLarge),
            Error::Extension(_) => Some(CloseCode::ExtensionFailed),
            Error::Timeout(_) => Some(CloseCode::UnexpectedServerError),
            Error::Io(_) | Error::Handshake(_) | Error::Proxy(_) | Error::Closing => None,
        }
    }
}

/// RFC 6455 framing violations. All map to close code 1002.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("reserved length field (127) had the top bit set")]
    InvalidExtendedLength,
    #[error("control frame payload exceeded 125 bytes")]
    ControlFrameTooLarge,
    #[error("control frame was fragmented (fin=false)")]
    FragmentedControlFrame,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("reserved bit set with no extension owning it")]
    UnexpectedReservedBit,
    #[error("frame exceeded the configured maximum frame size")]
    FrameTooLarge,
    #[error("server sent a masked frame")]
    MaskedFrameFromServer,
    #[error("non-continuation frame received mid-fragment-sequence")]
    UnexpectedDataFrame,
    #[error("continuation frame received with no sequence in progress")]
    UnexpectedContinuation,
    #[error("rsv1 set on a continuation frame")]
    Rsv1OnContinuation,
    #[error("invalid close frame payload")]
    InvalidCloseFrame,
}

/// Failures during the client Upgrade handshake.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
    #[error("server responded with status {0}, expected 101")]
    UnexpectedStatus(u16),
    #[error("missing or invalid Upgrade header")]
    MissingUpgradeHeader,
    #[error("missing or invalid Connection header")]
    MissingConnectionHeader,
    #[error("Sec-WebSocket-Accept did not match the expected value")]
    AcceptMismatch,
    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),
    #[error("response headers exceeded the parser's capacity")]
    HeadersTooLarge,
}

/// Failures negotiating the HTTP CONNECT tunnel before the Upgrade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy requires authentication (407)")]
    AuthenticationRequired,
    #[error("proxy returned an invalid response head: status {0}")]
    InvalidResponseHead(u16),
    #[error("proxy sent body bytes before the tunnel was established")]
    InvalidResponse,
    #[error("proxy handshake timed out")]
    Timeout,
    #[error("proxy closed the connection before completing the handshake")]
    RemoteConnectionClosed,
}

impl From<httparse::Error> for HandshakeError {
    fn from(e: httparse::Error) -> Self {
        HandshakeError::MalformedResponse(e.to_string())
    }
}
