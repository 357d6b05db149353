//! permessage-deflate (RFC 7692): the one concrete negotiated extension.
//! Compresses whole messages, not individual frames — RSV1 marks the first
//! frame of a compressed message and continuation frames carry the rest of
//! the compressed bytes uncompressed-looking but still part of the same
//! DEFLATE stream.

use std::slice;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, ProtocolError};
use crate::frame::{Frame, OpCode};

use super::{EncodedMessage, Extension, ExtensionBuilder, ExtensionOffer};

const EXT_NAME: &str = "permessage-deflate";
const MIN_WINDOW_BITS: u8 = 9;
const MAX_WINDOW_BITS: u8 = 15;
const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Negotiated (or about-to-be-offered) permessage-deflate parameters.
#[derive(Debug, Clone, Copy)]
pub struct PerMessageDeflateConfig {
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub max_decompressed_frame_size: usize,
    pub compression_level: Compression,
}

impl Default for PerMessageDeflateConfig {
    fn default() -> Self {
        PerMessageDeflateConfig {
            client_max_window_bits: MAX_WINDOW_BITS,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            max_decompressed_frame_size: 64 * 1024 * 1024,
            compression_level: Compression::fast(),
        }
    }
}

/// Offers `permessage-deflate` in the client request and builds the active
/// extension once the server's selected parameters (if any) are known.
pub struct PerMessageDeflateBuilder {
    pub requested: PerMessageDeflateConfig,
}

impl PerMessageDeflateBuilder {
    pub fn new(requested: PerMessageDeflateConfig) -> Self {
        PerMessageDeflateBuilder { requested }
    }
}

impl ExtensionBuilder for PerMessageDeflateBuilder {
    fn name(&self) -> &'static str {
        EXT_NAME
    }

    fn offer_header_value(&self) -> Option<String> {
        let mut offer = String::from(EXT_NAME);
        if self.requested.client_max_window_bits < MAX_WINDOW_BITS {
            offer.push_str(&format!("; client_max_window_bits={}", self.requested.client_max_window_bits));
        } else {
            offer.push_str("; client_max_window_bits");
        }
        if self.requested.server_max_window_bits < MAX_WINDOW_BITS {
            offer.push_str(&format!("; server_max_window_bits={}", self.requested.server_max_window_bits));
        }
        if self.requested.client_no_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        if self.requested.server_no_context_takeover {
            offer.push_str("; server_no_context_takeover");
        }
        Some(offer)
    }

    fn is_negotiated(&self) -> bool {
        true
    }

    fn build(&self, matched: Option<&ExtensionOffer>) -> Result<Option<Box<dyn Extension>>, Error> {
        let Some(offer) = matched else {
            return Ok(None);
        };

        let mut config = self.requested;
        for (key, value) in &offer.params {
            match key.as_str() {
                "client_max_window_bits" => {
                    if let Some(v) = value {
                        config.client_max_window_bits = parse_window_bits(v)?;
                    }
                }
                "server_max_window_bits" => {
                    if let Some(v) = value {
                        config.server_max_window_bits = parse_window_bits(v)?;
                    }
                }
                "client_no_context_takeover" => config.client_no_context_takeover = true,
                "server_no_context_takeover" => config.server_no_context_takeover = true,
                other => {
                    return Err(Error::Extension(format!("unknown permessage-deflate parameter: {other}")));
                }
            }
        }

        Ok(Some(Box::new(DeflateExtension::new(config))))
    }
}

fn parse_window_bits(raw: &str) -> Result<u8, Error> {
    let bits: u8 = raw
        .trim_matches('"')
        .trim()
        .parse()
        .map_err(|_| Error::Extension("invalid max_window_bits value".into()))?;
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::Extension("max_window_bits out of range 9..=15".into()))
    }
}

/// The active permessage-deflate extension for one connection.
pub struct DeflateExtension {
    config: PerMessageDeflateConfig,
    deflator: Deflator,
    inflator: Inflator,
    fragment_buffer: Vec<u8>,
    fragment_opcode: Option<OpCode>,
    compressing: bool,
}

impl DeflateExtension {
    pub fn new(config: PerMessageDeflateConfig) -> Self {
        DeflateExtension {
            deflator: Deflator::new(config.compression_level, config.client_max_window_bits),
            inflator: Inflator::new(config.server_max_window_bits),
            fragment_buffer: Vec::new(),
            fragment_opcode: None,
            compressing: false,
            config,
        }
    }

    fn inflate_message(&mut self, mut compressed: Vec<u8>) -> Result<Vec<u8>, Error> {
        compressed.extend_from_slice(&TRAILER);
        let mut decompressed = Vec::with_capacity(compressed.len() * 2);
        self.inflator
            .decompress(&compressed, &mut decompressed, self.config.max_decompressed_frame_size)?;
        if self.config.server_no_context_takeover {
            self.inflator.reset();
        }
        Ok(decompressed)
    }
}

impl Extension for DeflateExtension {
    fn name(&self) -> &'static str {
        EXT_NAME
    }

    fn owns_rsv1(&self) -> bool {
        true
    }

    fn encode_message(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<EncodedMessage, Error> {
        if opcode.is_control() {
            // Control frames are never compressed.
            return Ok(EncodedMessage { opcode, payload, rsv1: false, rsv2: false, rsv3: false });
        }

        let mut compressed = Vec::with_capacity(payload.len());
        self.deflator.compress(&payload, &mut compressed)?;
        let new_len = compressed.len().saturating_sub(TRAILER.len());
        compressed.truncate(new_len);

        if self.config.client_no_context_takeover {
            self.deflator.reset();
        }

        Ok(EncodedMessage { opcode, payload: compressed, rsv1: true, rsv2: false, rsv3: false })
    }

    fn decode_frame(&mut self, frame: Frame) -> Result<Option<Frame>, Error> {
        if frame.opcode == OpCode::Continuation {
            if frame.rsv1 {
                return Err(ProtocolError::Rsv1OnContinuation.into());
            }
            if !self.compressing {
                return Ok(Some(frame));
            }
            self.fragment_buffer.extend_from_slice(&frame.payload);
            if !frame.fin {
                return Ok(None);
            }
            self.compressing = false;
            let opcode = self.fragment_opcode.take().expect("compressing implies an opcode was recorded");
            let compressed = std::mem::take(&mut self.fragment_buffer);
            let decompressed = self.inflate_message(compressed)?;
            return Ok(Some(Frame { fin: true, rsv1: false, rsv2: frame.rsv2, rsv3: frame.rsv3, opcode, payload: decompressed }));
        }

        if !frame.rsv1 {
            return Ok(Some(frame));
        }

        self.fragment_opcode = Some(frame.opcode);
        if frame.fin {
            let decompressed = self.inflate_message(frame.payload)?;
            return Ok(Some(Frame { fin: true, rsv1: false, rsv2: frame.rsv2, rsv3: frame.rsv3, opcode: frame.opcode, payload: decompressed }));
        }
        self.compressing = true;
        self.fragment_buffer = frame.payload;
        Ok(None)
    }
}

/// zlib's deflate implementation treats a window size of 8 as 9 internally;
/// match that here so a configured `8` doesn't panic `Compress`/`Decompress`.
fn normalize_window_bits(bits: u8) -> u8 {
    if bits == 8 {
        9
    } else {
        bits
    }
}

struct Deflator {
    compress: Compress,
}

impl Deflator {
    fn new(level: Compression, window_bits: u8) -> Self {
        Deflator { compress: Compress::new_with_window_bits(level, false, normalize_window_bits(window_bits)) }
    }

    fn reset(&mut self) {
        self.compress.reset();
    }

    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), Error> {
        run_codec_loop(output, input.len(), |out_slice| {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(&input[(before_in as usize).min(input.len())..], out_slice, FlushCompress::Sync)
                .map_err(|e| Error::Extension(e.to_string()))?;
            Ok(CodecProgress {
                consumed: (self.compress.total_in() - before_in) as usize,
                produced: (self.compress.total_out() - before_out) as usize,
                status,
            })
        })
    }
}

struct Inflator {
    decompress: Decompress,
}

impl Inflator {
    fn new(window_bits: u8) -> Self {
        Inflator { decompress: Decompress::new_with_window_bits(false, normalize_window_bits(window_bits)) }
    }

    fn reset(&mut self) {
        self.decompress.reset(false);
    }

    fn decompress(&mut self, input: &[u8], output: &mut Vec<u8>, max_size: usize) -> Result<(), Error> {
        run_codec_loop(output, input.len(), |out_slice| {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&input[(before_in as usize).min(input.len())..], out_slice, FlushDecompress::Sync)
                .map_err(|e| Error::Extension(e.to_string()))?;
            Ok(CodecProgress {
                consumed: (self.decompress.total_in() - before_in) as usize,
                produced: (self.decompress.total_out() - before_out) as usize,
                status,
            })
        })
        .and_then(|()| {
            if output.len() > max_size {
                Err(Error::MessageTooLarge { limit: max_size })
            } else {
                Ok(())
            }
        })
    }
}

struct CodecProgress {
    consumed: usize,
    produced: usize,
    status: Status,
}

/// Drives a flate2 compress/decompress call to completion, growing `output`
/// as needed. `step` is handed a writable slice of spare output capacity and
/// reports how much input it consumed and output it produced.
fn run_codec_loop(
    output: &mut Vec<u8>,
    input_len: usize,
    mut step: impl FnMut(&mut [u8]) -> Result<CodecProgress, Error>,
) -> Result<(), Error> {
    loop {
        let output_len = output.len();
        if output_len == output.capacity() {
            output.reserve(input_len.max(4096));
        }

        // SAFETY: `out_slice` covers only the spare capacity beyond
        // `output_len`, and `set_len` below is bounded by what the codec
        // reports it actually wrote into that region.
        let out_slice = unsafe {
            slice::from_raw_parts_mut(output.as_mut_ptr().add(output_len), output.capacity() - output_len)
        };

        let progress = step(out_slice)?;

        unsafe {
            output.set_len(output_len + progress.produced);
        }

        match progress.status {
            Status::Ok | Status::BufError => {
                if progress.produced == 0 && progress.consumed == 0 {
                    return Ok(());
                }
            }
            Status::StreamEnd => return Ok(()),
        }
    }
}
