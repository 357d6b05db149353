//! Close-frame payload encoding/decoding (RFC 6455 section 7.4).

use crate::error::ProtocolError;

/// A close status code. Codes below 1000 and the reserved codes
/// 1004/1005/1006/1015 must never be put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnacceptableData,
    /// UTF-8 validation failure on a text message.
    DataInconsistentWithType,
    PolicyViolation,
    MessageTooLarge,
    ExtensionFailed,
    UnexpectedServerError,
    /// Observed-only: no close frame was sent by the peer at all.
    NoStatusReceived,
    Other(u16),
}

impl CloseCode {
    pub const fn as_u16(self) -> u16 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnacceptableData => 1003,
            CloseCode::DataInconsistentWithType => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooLarge => 1009,
            CloseCode::ExtensionFailed => 1010,
            CloseCode::UnexpectedServerError => 1011,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::Other(c) => c,
        }
    }

    pub const fn from_u16(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnacceptableData,
            1007 => CloseCode::DataInconsistentWithType,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooLarge,
            1010 => CloseCode::ExtensionFailed,
            1011 => CloseCode::UnexpectedServerError,
            1005 => CloseCode::NoStatusReceived,
            other => CloseCode::Other(other),
        }
    }

    /// Whether this code may legally appear in a close frame sent on the wire.
    pub fn is_sendable(self) -> bool {
        let code = self.as_u16();
        !(code < 1000 || matches!(code, 1004 | 1005 | 1006 | 1015))
    }
}

/// The user-visible close payload: a code and an optional UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: Option<String>,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<Option<String>>) -> Self {
        CloseFrame { code, reason: reason.into() }
    }

    /// Encodes this close frame as a wire payload: 2-byte big-endian code
    /// followed by the optional UTF-8 reason. Empty `reason` is omitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.reason.as_ref().map_or(0, |r| r.len()));
        out.extend_from_slice(&self.code.as_u16().to_be_bytes());
        if let Some(reason) = &self.reason {
            out.extend_from_slice(reason.as_bytes());
        }
        out
    }

    /// Decodes a close frame payload. An empty payload yields
    /// `CloseCode::NoStatusReceived` with no reason, per RFC 6455 7.1.5 — this
    /// code is never sent, only observed when the peer omits the payload.
    pub fn decode(payload: &[u8]) -> Result<CloseFrame, ProtocolError> {
        if payload.is_empty() {
            return Ok(CloseFrame { code: CloseCode::NoStatusReceived, reason: None });
        }
        if payload.len() < 2 {
            return Err(ProtocolError::InvalidCloseFrame);
        }
        let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
        let reason = if payload.len() > 2 {
            Some(
                std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidCloseFrame)?
                    .to_string(),
            )
        } else {
            None
        };
        Ok(CloseFrame { code, reason })
    }
}
