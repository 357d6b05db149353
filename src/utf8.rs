//! Incremental UTF-8 validation, usable across WebSocket fragments: a text
//! message's payload may be split across many continuation frames, and a
//! multi-byte code point can straddle a frame boundary, so validation can't
//! just call `str::from_utf8` once at the end.

/// Validates UTF-8 byte-by-byte across calls to `push`, remembering any
/// partial multi-byte sequence left over at the end of a chunk.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    /// Bytes of an in-progress multi-byte sequence not yet known to be valid.
    pending: [u8; 4],
    pending_len: u8,
    /// How many continuation bytes (0x80..=0xBF) are still expected.
    remaining: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Error;

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes into the validator. Returns an error as soon as
    /// an invalid sequence is detected.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Utf8Error> {
        let mut i = 0;
        while i < chunk.len() {
            if self.remaining > 0 {
                let b = chunk[i];
                if !(0x80..=0xBF).contains(&b) {
                    return Err(Utf8Error);
                }
                self.pending[self.pending_len as usize] = b;
                self.pending_len += 1;
                self.remaining -= 1;
                i += 1;
                if self.remaining == 0 {
                    // Full sequence collected; validate it as a unit to catch
                    // overlong encodings and out-of-range continuations that
                    // a plain "is it 0x80..=0xBF" check would miss.
                    let seq = &self.pending[..self.pending_len as usize];
                    std::str::from_utf8(seq).map_err(|_| Utf8Error)?;
                    self.pending_len = 0;
                }
                continue;
            }

            let b = chunk[i];
            if b < 0x80 {
                i += 1;
            } else if b & 0b1110_0000 == 0b1100_0000 {
                if b < 0xC2 {
                    // overlong 2-byte encoding
                    return Err(Utf8Error);
                }
                self.begin_sequence(b, 1);
                i += 1;
            } else if b & 0b1111_0000 == 0b1110_0000 {
                self.begin_sequence(b, 2);
                i += 1;
            } else if b & 0b1111_1000 == 0b1111_0000 {
                if b > 0xF4 {
                    return Err(Utf8Error);
                }
                self.begin_sequence(b, 3);
                i += 1;
            } else {
                return Err(Utf8Error);
            }
        }
        Ok(())
    }

    fn begin_sequence(&mut self, lead: u8, continuations: u8) {
        self.pending[0] = lead;
        self.pending_len = 1;
        self.remaining = continuations;
    }

    /// Call once the message is complete (fin=true). Fails if a multi-byte
    /// sequence was left unterminated.
    pub fn finish(self) -> Result<(), Utf8Error> {
        if self.remaining == 0 {
            Ok(())
        } else {
            Err(Utf8Error)
        }
    }

    /// Validates a complete, non-streaming byte slice in one call.
    pub fn validate_complete(bytes: &[u8]) -> Result<(), Utf8Error> {
        let mut v = Utf8Validator::new();
        v.push(bytes)?;
        v.finish()
    }
}
