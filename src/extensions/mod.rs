//! The extension negotiation framework: an ordered list of extensions, each
//! able to transform outgoing and incoming frames. `permessage-deflate` is
//! the one concrete negotiated extension; [`Extension`] is also the seam a
//! caller can plug a non-negotiated extension into (one that is always
//! instantiated, regardless of what the server offers).

pub mod deflate;

use crate::error::Error;
use crate::frame::{Frame, OpCode};

/// A whole outgoing message, transformed and ready for the outbound
/// fragmenter. `rsv1`/`rsv2`/`rsv3` indicate which reserved bits the first
/// frame of the eventual wire encoding should carry.
pub struct EncodedMessage {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
}

/// One entry in the extension pipeline. Control frames never reach these
/// hooks — they are routed directly to the connection state machine.
pub trait Extension: Send {
    /// The name this extension negotiated under, or a fixed identifier for a
    /// non-negotiated extension. Used only for diagnostics.
    fn name(&self) -> &'static str;

    /// Transforms a whole outgoing data message before it is fragmented and
    /// framed.
    fn encode_message(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<EncodedMessage, Error>;

    /// Feeds one already frame-decoded incoming data frame. Returns
    /// `Ok(None)` if the extension is still buffering (e.g. waiting for the
    /// fin frame of a compressed message), or `Ok(Some(frame))` once it has a
    /// frame ready to hand to the message reassembler. The returned frame's
    /// `rsv1` must be cleared if this extension owns it.
    fn decode_frame(&mut self, frame: Frame) -> Result<Option<Frame>, Error>;

    /// Whether this extension owns RSV1 on outgoing/incoming frames.
    fn owns_rsv1(&self) -> bool {
        false
    }

    /// Flushes and frees any per-connection state (e.g. deflate windows).
    /// Called when the connection's top-level task is cancelled or closes.
    fn shutdown(&mut self) {}
}

/// One parsed `Sec-WebSocket-Extensions` offer: a name and its
/// semicolon-separated parameters, each an optional `key=value` pair (bare
/// keys like `client_no_context_takeover` parse with `value: None`).
#[derive(Debug, Clone)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Builds one extension, given what (if anything) the server selected for
/// it. Registered with the handshake so negotiation and construction stay
/// next to each other instead of scattered across the handshake module.
pub trait ExtensionBuilder: Send {
    /// The name this builder offers under, matched case-insensitively
    /// against the server's selected extensions.
    fn name(&self) -> &'static str;

    /// The value to send for this builder's entry in the client's
    /// `Sec-WebSocket-Extensions` header, or `None` to not offer it at all.
    fn offer_header_value(&self) -> Option<String>;

    /// Non-negotiated extensions build unconditionally, ignoring whatever
    /// the server selected (and are instantiated even if the server didn't
    /// echo them back at all).
    fn is_negotiated(&self) -> bool {
        true
    }

    /// Builds the concrete extension. `matched` is the parsed offer the
    /// server selected for this builder's name, if any.
    fn build(&self, matched: Option<&ExtensionOffer>) -> Result<Option<Box<dyn Extension>>, Error>;
}

/// An ordered list of negotiated/non-negotiated extensions.
#[derive(Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionPipeline {
    pub fn new(extensions: Vec<Box<dyn Extension>>) -> Self {
        ExtensionPipeline { extensions }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// `true` if any extension in the pipeline owns RSV1 — used by the frame
    /// decoder to decide whether an incoming RSV1 bit is legal.
    pub fn owns_rsv1(&self) -> bool {
        self.extensions.iter().any(|e| e.owns_rsv1())
    }

    /// Runs a whole outgoing message through the pipeline in *reverse* order
    /// — the mirror of the receive-side pipeline order — so the first
    /// extension in the list gets the last (outermost) crack at setting RSV
    /// bits, matching the wire frame produced for a receive-side pipeline
    /// walk in forward order.
    pub fn encode_outgoing(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<EncodedMessage, Error> {
        let mut message = EncodedMessage { opcode, payload, rsv1: false, rsv2: false, rsv3: false };
        for ext in self.extensions.iter_mut().rev() {
            let encoded = ext.encode_message(message.opcode, message.payload)?;
            message = encoded;
        }
        Ok(message)
    }

    /// Runs one incoming data frame through the pipeline in order. Returns
    /// `None` if some extension is still buffering fragments.
    pub fn decode_incoming(&mut self, mut frame: Frame) -> Result<Option<Frame>, Error> {
        for ext in self.extensions.iter_mut() {
            match ext.decode_frame(frame)? {
                Some(f) => frame = f,
                None => return Ok(None),
            }
        }
        Ok(Some(frame))
    }

    pub fn shutdown(&mut self) {
        for ext in self.extensions.iter_mut() {
            ext.shutdown();
        }
    }
}
