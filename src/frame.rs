//! The WebSocket frame codec (RFC 6455 section 5.2): pure byte-in/frame-out,
//! frame-in/byte-out. No I/O happens in this module — `FrameDecoder` buffers
//! bytes handed to it and yields whole frames when enough have accumulated;
//! `encode_client_frame` turns a `Frame` into bytes ready to write.

use crate::error::ProtocolError;
use crate::mask::MaskingKey;

/// The set of opcodes this codec understands. Reserved opcodes (3-7,
/// 0xB-0xF) have no variant: they are rejected during decode as
/// `ProtocolError::UnknownOpcode`, since this library negotiates no
/// extension that claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }

    fn to_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    fn from_u8(v: u8) -> Result<OpCode, ProtocolError> {
        match v {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// A decoded (or about-to-be-encoded) WebSocket frame. `payload` is
/// post-unmask for incoming frames, pre-mask for outgoing ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(opcode: OpCode, fin: bool, payload: Vec<u8>) -> Frame {
        Frame { fin, rsv1: false, rsv2: false, rsv3: false, opcode, payload }
    }

    pub fn control(opcode: OpCode, payload: Vec<u8>) -> Frame {
        Frame { fin: true, rsv1: false, rsv2: false, rsv3: false, opcode, payload }
    }
}

/// Which RSV bits a frame is permitted to carry, decided by whichever
/// extensions are active. Only RSV1 has a concrete owner (permessage-deflate)
/// in this library, but all three are modeled for forward compatibility with
/// hypothetical pluggable extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowedRsv {
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
}

/// Encodes a frame as a client would send it: always masked with a freshly
/// generated key, per RFC 6455 section 5.3.
pub fn encode_client_frame(frame: &Frame) -> Vec<u8> {
    let key = MaskingKey::generate();
    encode_client_frame_with_key(frame, key)
}

/// Same as [`encode_client_frame`] but with an explicit key, for tests that
/// need deterministic output.
pub fn encode_client_frame_with_key(frame: &Frame, key: MaskingKey) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let mut byte0 = frame.opcode.to_u8();
    if frame.fin {
        byte0 |= 0x80;
    }
    if frame.rsv1 {
        byte0 |= 0x40;
    }
    if frame.rsv2 {
        byte0 |= 0x20;
    }
    if frame.rsv3 {
        byte0 |= 0x10;
    }
    out.push(byte0);

    if len <= 125 {
        out.push(0x80 | len as u8);
    } else if len <= 0xFFFF {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(&key.0);

    let mut payload = frame.payload.clone();
    key.apply(&mut payload);
    out.extend_from_slice(&payload);

    out
}

/// Buffers incoming bytes and parses whole frames out as they become
/// available. Resumable: a partial frame at the end of one `feed` call is
/// picked back up on the next.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one frame from the buffered bytes. Returns
    /// `Ok(None)` if more bytes are needed. Client frames from a server are
    /// always unmasked; a masked incoming frame is a protocol error.
    pub fn decode_next(
        &mut self,
        max_frame_size: usize,
        allowed_rsv: AllowedRsv,
    ) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = self.buf[0];
        let byte1 = self.buf[1];

        let fin = byte0 & 0x80 != 0;
        let rsv1 = byte0 & 0x40 != 0;
        let rsv2 = byte0 & 0x20 != 0;
        let rsv3 = byte0 & 0x10 != 0;
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;

        let masked = byte1 & 0x80 != 0;
        let len7 = byte1 & 0x7F;

        let mut header_len = 2usize;
        let payload_len: u64;

        if len7 <= 125 {
            payload_len = len7 as u64;
        } else if len7 == 126 {
            if self.buf.len() < header_len + 2 {
                return Ok(None);
            }
            payload_len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64;
            header_len += 2;
        } else {
            if self.buf.len() < header_len + 8 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&self.buf[2..10]);
            if len_bytes[0] & 0x80 != 0 {
                return Err(ProtocolError::InvalidExtendedLength);
            }
            payload_len = u64::from_be_bytes(len_bytes);
            header_len += 8;
        }

        if masked {
            // Client-mode decoder: only the server's frames pass through
            // here, and the server must never mask.
            return Err(ProtocolError::MaskedFrameFromServer);
        }

        if opcode.is_control() && payload_len > 125 {
            return Err(ProtocolError::ControlFrameTooLarge);
        }
        if opcode.is_control() && !fin {
            return Err(ProtocolError::FragmentedControlFrame);
        }

        if payload_len > max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge);
        }

        if (rsv1 && !allowed_rsv.rsv1) || (rsv2 && !allowed_rsv.rsv2) || (rsv3 && !allowed_rsv.rsv3)
        {
            return Err(ProtocolError::UnexpectedReservedBit);
        }

        let total_len = header_len + payload_len as usize;
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let payload = self.buf[header_len..total_len].to_vec();
        self.buf.drain(0..total_len);

        Ok(Some(Frame { fin, rsv1, rsv2, rsv3, opcode, payload }))
    }
}

#[cfg(test)]
/// Encodes a frame the way a server would: unmasked. Used to feed
/// `FrameDecoder` (which runs in client mode) in tests without going through
/// a mask/unmask round trip.
fn encode_unmasked_frame(frame: &Frame) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 10);

    let mut byte0 = frame.opcode.to_u8();
    if frame.fin {
        byte0 |= 0x80;
    }
    if frame.rsv1 {
        byte0 |= 0x40;
    }
    if frame.rsv2 {
        byte0 |= 0x20;
    }
    if frame.rsv3 {
        byte0 |= 0x10;
    }
    out.push(byte0);

    if len <= 125 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(&frame.payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(frame: Frame) -> Frame {
        let bytes = encode_unmasked_frame(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        decoder
            .decode_next(usize::MAX, AllowedRsv { rsv1: true, rsv2: true, rsv3: true })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn encodes_and_decodes_small_text_frame() {
        let frame = Frame::data(OpCode::Text, true, b"hello".to_vec());
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn encodes_and_decodes_extended_length_frames() {
        for len in [0usize, 125, 126, 65535, 65536, 70000] {
            let payload = vec![0xAB; len];
            let frame = Frame::data(OpCode::Binary, true, payload);
            let decoded = round_trip(frame.clone());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn client_encoder_always_masks() {
        let frame = Frame::data(OpCode::Text, true, b"hi".to_vec());
        let bytes = encode_client_frame(&frame);
        assert_eq!(bytes[1] & 0x80, 0x80);
    }

    #[test]
    fn client_encode_decode_round_trip_via_unmask() {
        let frame = Frame::data(OpCode::Text, true, b"round trip me".to_vec());
        let key = MaskingKey([5, 6, 7, 8]);
        let bytes = encode_client_frame_with_key(&frame, key);
        // simulate what a peer does: strip the mask bit, drop the key bytes,
        // unmask the payload in place.
        let mut unmasked = bytes.clone();
        unmasked[1] &= 0x7F;
        unmasked.drain(2..6);
        let mut payload = unmasked[2..].to_vec();
        key.apply(&mut payload);
        unmasked.truncate(2);
        unmasked.extend_from_slice(&payload);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&unmasked);
        let decoded = decoder
            .decode_next(usize::MAX, AllowedRsv::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_masked_frame_from_server() {
        let frame = Frame::data(OpCode::Text, true, b"hi".to_vec());
        let bytes = encode_client_frame_with_key(&frame, MaskingKey([1, 1, 1, 1]));
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder
            .decode_next(usize::MAX, AllowedRsv::default())
            .unwrap_err();
        assert_eq!(err, ProtocolError::MaskedFrameFromServer);
    }

    #[test]
    fn rejects_oversized_frame() {
        let frame = Frame::data(OpCode::Binary, true, vec![0u8; 1000]);
        let bytes = encode_unmasked_frame(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder.decode_next(10, AllowedRsv::default()).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge);
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let frame = Frame { fin: false, rsv1: false, rsv2: false, rsv3: false, opcode: OpCode::Ping, payload: vec![1, 2] };
        let bytes = encode_unmasked_frame(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder.decode_next(usize::MAX, AllowedRsv::default()).unwrap_err();
        assert_eq!(err, ProtocolError::FragmentedControlFrame);
    }

    #[test]
    fn rejects_oversized_control_frame() {
        let frame = Frame::control(OpCode::Ping, vec![0u8; 126]);
        let bytes = encode_unmasked_frame(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder.decode_next(usize::MAX, AllowedRsv::default()).unwrap_err();
        assert_eq!(err, ProtocolError::ControlFrameTooLarge);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let bytes = vec![0x83, 0x00]; // fin=1, opcode=3 (reserved)
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder.decode_next(usize::MAX, AllowedRsv::default()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOpcode(3));
    }

    #[test]
    fn rejects_reserved_bit_without_owning_extension() {
        let bytes = vec![0xC1, 0x00]; // fin=1, rsv1=1, opcode=text, len=0
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let err = decoder.decode_next(usize::MAX, AllowedRsv::default()).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedReservedBit);
    }

    #[test]
    fn accepts_rsv1_when_extension_owns_it() {
        let frame = Frame { fin: true, rsv1: true, rsv2: false, rsv3: false, opcode: OpCode::Binary, payload: vec![1, 2, 3] };
        let bytes = encode_unmasked_frame(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let decoded = decoder
            .decode_next(usize::MAX, AllowedRsv { rsv1: true, rsv2: false, rsv3: false })
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn feed_can_arrive_in_pieces() {
        let frame = Frame::data(OpCode::Text, true, b"partial delivery, byte by byte".to_vec());
        let bytes = encode_unmasked_frame(&frame);

        let mut decoder = FrameDecoder::new();
        for chunk in bytes.chunks(3) {
            decoder.feed(chunk);
            if let Some(f) = decoder.decode_next(usize::MAX, AllowedRsv::default()).unwrap() {
                assert_eq!(f, frame);
                return;
            }
        }
        panic!("frame never completed");
    }

    proptest! {
        #[test]
        fn round_trip_any_data_frame(payload: Vec<u8>, fin: bool) {
            let frame = Frame::data(OpCode::Binary, fin, payload);
            let decoded = round_trip(frame.clone());
            prop_assert_eq!(decoded, frame);
        }
    }
}

