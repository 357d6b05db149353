//! Message reassembly: collates data frames (already passed through the
//! extension pipeline) into whole user-visible messages, enforcing the
//! maximum size and UTF-8 validity of text messages along the way.

use crate::error::{Error, ProtocolError};
use crate::frame::{Frame, OpCode};
use crate::utf8::Utf8Validator;

/// A complete, user-visible WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug)]
enum InProgress {
    None,
    Text { buf: Vec<u8>, validator: Utf8Validator },
    Binary { buf: Vec<u8> },
}

/// Collates fragments into whole messages. A non-continuation data frame
/// with `fin=true` yields an immediate message; otherwise a fragment
/// sequence opens and must be continued until a `fin=true` continuation
/// frame closes it. Control frames may interleave without disturbing an
/// open sequence (they never reach this type — the caller routes them to
/// the state machine directly).
pub struct MessageReassembler {
    max_size: usize,
    validate_utf8: bool,
    in_progress: InProgress,
    running_total: usize,
}

impl MessageReassembler {
    pub fn new(max_size: usize, validate_utf8: bool) -> Self {
        MessageReassembler { max_size, validate_utf8, in_progress: InProgress::None, running_total: 0 }
    }

    /// Feeds one already-extension-decoded data frame (opcode is Text,
    /// Binary, or Continuation). Returns `Some(message)` once a `fin=true`
    /// frame completes the sequence.
    pub fn push_data_frame(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        debug_assert!(frame.opcode.is_data());

        match (&mut self.in_progress, frame.opcode) {
            (InProgress::None, OpCode::Continuation) => {
                return Err(ProtocolError::UnexpectedContinuation.into());
            }
            (InProgress::None, OpCode::Text) => {
                let mut validator = Utf8Validator::new();
                if self.validate_utf8 {
                    validator.push(&frame.payload).map_err(|_| Error::InvalidUtf8)?;
                }
                self.running_total = 0;
                self.account(frame.payload.len())?;
                if frame.fin {
                    let text = if self.validate_utf8 {
                        validator.finish().map_err(|_| Error::InvalidUtf8)?;
                        String::from_utf8(frame.payload).map_err(|_| Error::InvalidUtf8)?
                    } else {
                        String::from_utf8_lossy(&frame.payload).into_owned()
                    };
                    self.reset();
                    return Ok(Some(Message::Text(text)));
                }
                self.in_progress = InProgress::Text { buf: frame.payload, validator };
            }
            (InProgress::None, OpCode::Binary) => {
                self.running_total = 0;
                self.account(frame.payload.len())?;
                if frame.fin {
                    let payload = frame.payload;
                    self.reset();
                    return Ok(Some(Message::Binary(payload)));
                }
                self.in_progress = InProgress::Binary { buf: frame.payload };
            }
            (InProgress::Text { .. }, OpCode::Text) | (InProgress::Binary { .. }, OpCode::Binary) => {
                return Err(ProtocolError::UnexpectedDataFrame.into());
            }
            (InProgress::None, _) => unreachable!("data opcodes are exhaustively matched above"),
            (InProgress::Text { buf, validator }, OpCode::Continuation) => {
                self.running_total += frame.payload.len();
                if self.running_total > self.max_size {
                    self.reset();
                    return Err(Error::MessageTooLarge { limit: self.max_size });
                }
                if self.validate_utf8 {
                    validator.push(&frame.payload).map_err(|_| Error::InvalidUtf8)?;
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    if self.validate_utf8 {
                        validator.clone().finish().map_err(|_| Error::InvalidUtf8)?;
                    }
                    let InProgress::Text { buf, .. } = std::mem::replace(&mut self.in_progress, InProgress::None) else {
                        unreachable!()
                    };
                    self.reset();
                    let text = if self.validate_utf8 {
                        String::from_utf8(buf).map_err(|_| Error::InvalidUtf8)?
                    } else {
                        String::from_utf8_lossy(&buf).into_owned()
                    };
                    return Ok(Some(Message::Text(text)));
                }
            }
            (InProgress::Binary { buf }, OpCode::Continuation) => {
                self.running_total += frame.payload.len();
                if self.running_total > self.max_size {
                    self.reset();
                    return Err(Error::MessageTooLarge { limit: self.max_size });
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    let InProgress::Binary { buf } = std::mem::replace(&mut self.in_progress, InProgress::None) else {
                        unreachable!()
                    };
                    self.reset();
                    return Ok(Some(Message::Binary(buf)));
                }
            }
            (InProgress::Text { .. }, OpCode::Binary) | (InProgress::Binary { .. }, OpCode::Text) => {
                return Err(ProtocolError::UnexpectedDataFrame.into());
            }
            (_, OpCode::Close | OpCode::Ping | OpCode::Pong) => {
                unreachable!("control frames are routed to the state machine, not the reassembler")
            }
        }

        Ok(None)
    }

    fn account(&mut self, additional: usize) -> Result<(), Error> {
        self.running_total += additional;
        if self.running_total > self.max_size {
            self.reset();
            return Err(Error::MessageTooLarge { limit: self.max_size });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.in_progress = InProgress::None;
        self.running_total = 0;
    }

    pub fn is_mid_sequence(&self) -> bool {
        !matches!(self.in_progress, InProgress::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn single_fin_frame_yields_message_immediately() {
        let mut r = MessageReassembler::new(1024, true);
        let msg = r
            .push_data_frame(Frame::data(OpCode::Text, true, b"hello".to_vec()))
            .unwrap();
        assert_eq!(msg, Some(Message::Text("hello".into())));
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut r = MessageReassembler::new(1024, true);
        assert_eq!(r.push_data_frame(Frame::data(OpCode::Text, false, b"hel".to_vec())).unwrap(), None);
        assert!(r.is_mid_sequence());
        assert_eq!(r.push_data_frame(Frame::data(OpCode::Continuation, false, b"lo ".to_vec())).unwrap(), None);
        let msg = r
            .push_data_frame(Frame::data(OpCode::Continuation, true, b"world".to_vec()))
            .unwrap();
        assert_eq!(msg, Some(Message::Text("hello world".into())));
        assert!(!r.is_mid_sequence());
    }

    #[test]
    fn non_continuation_mid_sequence_is_protocol_error() {
        let mut r = MessageReassembler::new(1024, true);
        r.push_data_frame(Frame::data(OpCode::Text, false, b"hel".to_vec())).unwrap();
        let err = r.push_data_frame(Frame::data(OpCode::Text, true, b"lo".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedDataFrame)));
    }

    #[test]
    fn continuation_without_sequence_is_protocol_error() {
        let mut r = MessageReassembler::new(1024, true);
        let err = r
            .push_data_frame(Frame::data(OpCode::Continuation, true, b"oops".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedContinuation)));
    }

    #[test]
    fn invalid_utf8_fails_text_message() {
        let mut r = MessageReassembler::new(1024, true);
        let err = r
            .push_data_frame(Frame::data(OpCode::Text, true, vec![0xFF, 0xFE]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));
    }

    #[test]
    fn invalid_utf8_allowed_when_validation_disabled() {
        let mut r = MessageReassembler::new(1024, false);
        let msg = r.push_data_frame(Frame::data(OpCode::Text, true, vec![0xFF, 0xFE])).unwrap();
        assert!(matches!(msg, Some(Message::Text(_))));
    }

    #[test]
    fn exceeding_max_size_is_an_error() {
        let mut r = MessageReassembler::new(4, true);
        let err = r
            .push_data_frame(Frame::data(OpCode::Binary, true, vec![0u8; 5]))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { limit: 4 }));
    }

    #[test]
    fn exceeding_max_size_across_fragments_is_an_error() {
        let mut r = MessageReassembler::new(4, true);
        r.push_data_frame(Frame::data(OpCode::Binary, false, vec![0u8; 3])).unwrap();
        let err = r
            .push_data_frame(Frame::data(OpCode::Continuation, true, vec![0u8; 3]))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { limit: 4 }));
    }
}
