//! Binds the frame codec, extension pipeline, state machine, and message
//! reassembler to an established duplex stream (spec §4.7). Runs as one
//! cooperative loop per connection — reading bytes, accepting outbound
//! writes, and ticking the auto-ping timer are all handled by the same
//! `tokio::select!`, so the state machine needs no lock (spec §5: "single
//! context access obviates locks").

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{trace, warn};

use crate::close::{CloseCode, CloseFrame};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::extensions::{EncodedMessage, ExtensionPipeline};
use crate::frame::{encode_client_frame, AllowedRsv, Frame, FrameDecoder, OpCode};
use crate::message::{Message, MessageReassembler};
use crate::state::{Action, ConnState, StateMachine};

const READ_CHUNK: usize = 8 * 1024;

/// One outbound write request.
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(CloseFrame),
}

/// A cheaply cloned handle for writing to an open connection. Given to the
/// user handler and reused internally for auto-replies (pong, close echo).
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Sender {
    pub fn text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.tx.send(Outbound::Text(text.into())).map_err(|_| Error::Closing)
    }

    pub fn binary(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.tx.send(Outbound::Binary(data.into())).map_err(|_| Error::Closing)
    }

    pub fn ping(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.tx.send(Outbound::Ping(data.into())).map_err(|_| Error::Closing)
    }

    pub fn close(&self, frame: CloseFrame) -> Result<(), Error> {
        self.tx.send(Outbound::Close(frame)).map_err(|_| Error::Closing)
    }
}

/// The channel the user handler reads whole inbound messages from.
pub type Inbox = mpsc::UnboundedReceiver<Message>;

/// Drives one connection to completion: runs `handler` alongside the
/// reader/writer loop, then (per spec §4.7) initiates a local close if the
/// handler returned while still Open, and waits up to `close_timeout` for
/// the peer's echo before forcing the transport shut.
pub async fn run<S, F, Fut>(
    mut stream: S,
    config: &ClientConfig,
    mut pipeline: ExtensionPipeline,
    leftover_bytes: Vec<u8>,
    handler: F,
) -> Result<Option<CloseFrame>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Sender, Inbox) -> Fut,
    Fut: Future<Output = ()>,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (message_tx, message_rx) = mpsc::unbounded_channel::<Message>();
    let mut message_tx = Some(message_tx);
    let sender = Sender { tx: outbound_tx };

    let handler_fut = handler(sender, message_rx);
    tokio::pin!(handler_fut);
    let mut handler_done = false;

    let mut decoder = FrameDecoder::new();
    decoder.feed(&leftover_bytes);

    let mut reassembler = MessageReassembler::new(config.max_message_size, config.validate_utf8);
    let mut state = StateMachine::new();

    let mut ping_interval = config.auto_ping.map(|period| {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        interval
    });
    let ping_period = config.auto_ping;

    let mut close_deadline: Option<Pin<Box<time::Sleep>>> = None;
    let mut read_buf = vec![0u8; READ_CHUNK];

    let result: Result<(), Error> = loop {
        if handler_done && state.state() == ConnState::Closed {
            break Ok(());
        }

        tokio::select! {
            _ = &mut handler_fut, if !handler_done => {
                handler_done = true;
                if state.can_send_user_data() {
                    let action = state.close(CloseFrame::new(CloseCode::NormalClosure, None));
                    if let Err(e) = apply_action(action, &mut stream, &mut pipeline, config.max_frame_size).await {
                        break Err(e);
                    }
                    close_deadline = Some(Box::pin(time::sleep(config.close_timeout)));
                }
            }

            read_result = stream.read(&mut read_buf) => {
                let n = match read_result {
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                if n == 0 {
                    if state.state() == ConnState::Closed {
                        break Ok(());
                    }
                    break Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed without a close frame").into());
                }
                decoder.feed(&read_buf[..n]);
                if let Err(e) = drain_frames(
                    &mut decoder, config.max_frame_size, &mut pipeline, &mut reassembler,
                    &mut state, &mut stream, message_tx.as_ref(),
                ).await {
                    break Err(e);
                }
                // The inbound stream is single-consumer and ends when the
                // connection enters Closed — drop the sender so a handler
                // blocked on `inbox.recv()` unblocks even if it never returns.
                if state.state() == ConnState::Closed {
                    message_tx = None;
                }
            }

            Some(cmd) = outbound_rx.recv() => {
                let rejected = matches!(cmd, Outbound::Text(_) | Outbound::Binary(_)) && !state.can_send_user_data();
                if rejected {
                    warn!("dropping a write queued after the connection began closing");
                } else {
                    let starting_close = matches!(cmd, Outbound::Close(_)) && state.can_send_user_data();
                    if let Err(e) = write_outbound(cmd, &mut stream, &mut pipeline, &mut state, config.max_frame_size).await {
                        break Err(e);
                    }
                    if starting_close {
                        close_deadline = Some(Box::pin(time::sleep(config.close_timeout)));
                    }
                }
            }

            _ = tick_optional(&mut ping_interval) => {
                if let Some(period) = ping_period {
                    let action = state.auto_ping_tick(period);
                    if let Err(e) = apply_action(action, &mut stream, &mut pipeline, config.max_frame_size).await {
                        break Err(e);
                    }
                }
            }

            _ = sleep_optional(&mut close_deadline) => {
                warn!("peer did not echo close within the configured timeout");
                break Ok(());
            }
        }
    };

    pipeline.shutdown();
    let _ = stream.shutdown().await;

    match result {
        Ok(()) => Ok(state.close_frame().cloned()),
        Err(e) => Err(e),
    }
}

async fn tick_optional(interval: &mut Option<time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures_util::future::pending::<()>().await,
    }
}

async fn sleep_optional(deadline: &mut Option<Pin<Box<time::Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => futures_util::future::pending::<()>().await,
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &Frame) -> Result<(), Error> {
    trace!(opcode = ?frame.opcode, len = frame.payload.len(), fin = frame.fin, "writing frame");
    let bytes = encode_client_frame(frame);
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn apply_action<S: AsyncWrite + Unpin>(
    action: Action,
    stream: &mut S,
    pipeline: &mut ExtensionPipeline,
    max_frame_size: usize,
) -> Result<(), Error> {
    match action {
        Action::SendClose(frame) => write_frame(stream, &Frame::control(OpCode::Close, frame.encode())).await,
        Action::SendPing(data) => write_frame(stream, &Frame::control(OpCode::Ping, data)).await,
        Action::SendPong(data) => write_frame(stream, &Frame::control(OpCode::Pong, data)).await,
        Action::CloseConnection(code) => {
            write_frame(stream, &Frame::control(OpCode::Close, CloseFrame::new(code, None).encode())).await?;
            Err(Error::Timeout("no pong received within the auto-ping period"))
        }
        Action::Wait | Action::Stop | Action::None => {
            let _ = (pipeline, max_frame_size);
            Ok(())
        }
    }
}

async fn write_outbound<S: AsyncWrite + Unpin>(
    cmd: Outbound,
    stream: &mut S,
    pipeline: &mut ExtensionPipeline,
    state: &mut StateMachine,
    max_frame_size: usize,
) -> Result<(), Error> {
    match cmd {
        Outbound::Text(text) => write_data(stream, pipeline, max_frame_size, OpCode::Text, text.into_bytes()).await,
        Outbound::Binary(data) => write_data(stream, pipeline, max_frame_size, OpCode::Binary, data).await,
        Outbound::Ping(data) => write_frame(stream, &Frame::control(OpCode::Ping, data)).await,
        Outbound::Pong(data) => write_frame(stream, &Frame::control(OpCode::Pong, data)).await,
        Outbound::Close(frame) => apply_action(state.close(frame), stream, pipeline, max_frame_size).await,
    }
}

async fn write_data<S: AsyncWrite + Unpin>(
    stream: &mut S,
    pipeline: &mut ExtensionPipeline,
    max_frame_size: usize,
    opcode: OpCode,
    payload: Vec<u8>,
) -> Result<(), Error> {
    let encoded = pipeline.encode_outgoing(opcode, payload)?;
    for frame in fragment_encoded(encoded, max_frame_size) {
        write_frame(stream, &frame).await?;
    }
    Ok(())
}

/// Splits an already extension-encoded message into wire frames no larger
/// than `max_frame_size` (spec §4.8): the already-compressed payload is
/// fragmented, never the pre-compression message.
fn fragment_encoded(message: EncodedMessage, max_frame_size: usize) -> Vec<Frame> {
    if message.payload.is_empty() {
        return vec![Frame { fin: true, rsv1: message.rsv1, rsv2: message.rsv2, rsv3: message.rsv3, opcode: message.opcode, payload: Vec::new() }];
    }

    let chunk_size = max_frame_size.max(1);
    let chunks: Vec<&[u8]> = message.payload.chunks(chunk_size).collect();
    let last = chunks.len() - 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let opcode = if i == 0 { message.opcode } else { OpCode::Continuation };
            let (rsv1, rsv2, rsv3) = if i == 0 { (message.rsv1, message.rsv2, message.rsv3) } else { (false, false, false) };
            Frame { fin: i == last, rsv1, rsv2, rsv3, opcode, payload: chunk.to_vec() }
        })
        .collect()
}

async fn drain_frames<S: AsyncWrite + Unpin>(
    decoder: &mut FrameDecoder,
    max_frame_size: usize,
    pipeline: &mut ExtensionPipeline,
    reassembler: &mut MessageReassembler,
    state: &mut StateMachine,
    stream: &mut S,
    message_tx: Option<&mpsc::UnboundedSender<Message>>,
) -> Result<(), Error> {
    let allowed_rsv = AllowedRsv { rsv1: pipeline.owns_rsv1(), rsv2: false, rsv3: false };

    loop {
        let frame = match decoder.decode_next(max_frame_size, allowed_rsv) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(protocol_error) => {
                let error = Error::from(protocol_error);
                best_effort_close(stream, &error).await;
                return Err(error);
            }
        };

        if let Err(error) = handle_frame(frame, pipeline, reassembler, state, stream, message_tx).await {
            best_effort_close(stream, &error).await;
            return Err(error);
        }
    }
}

async fn handle_frame<S: AsyncWrite + Unpin>(
    frame: Frame,
    pipeline: &mut ExtensionPipeline,
    reassembler: &mut MessageReassembler,
    state: &mut StateMachine,
    stream: &mut S,
    message_tx: Option<&mpsc::UnboundedSender<Message>>,
) -> Result<(), Error> {
    if frame.opcode.is_control() {
        match frame.opcode {
            OpCode::Close => {
                let close_frame = CloseFrame::decode(&frame.payload)?;
                let action = state.received_close(close_frame);
                apply_action(action, stream, pipeline, usize::MAX).await?;
            }
            OpCode::Ping => {
                let action = state.received_ping(frame.payload);
                apply_action(action, stream, pipeline, usize::MAX).await?;
            }
            OpCode::Pong => state.received_pong(&frame.payload),
            _ => unreachable!("only close/ping/pong are control opcodes"),
        }
        return Ok(());
    }

    if let Some(decoded) = pipeline.decode_incoming(frame)? {
        if let Some(message) = reassembler.push_data_frame(decoded)? {
            if let Some(tx) = message_tx {
                let _ = tx.send(message);
            }
        }
    }
    Ok(())
}

async fn best_effort_close<S: AsyncWrite + Unpin>(stream: &mut S, error: &Error) {
    if let Some(code) = error.close_code() {
        let _ = write_frame(stream, &Frame::control(OpCode::Close, CloseFrame::new(code, None).encode())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn echoes_a_text_message_and_closes_normally() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ClientConfig { extensions: Vec::new(), ..ClientConfig::default() };

        let server_task = tokio::spawn(async move {
            let mut decoder = ServerSideDecoder::default();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = server.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                decoder.feed(&buf[..n]);
                while let Some(frame) = decoder.decode_next() {
                    match frame.opcode {
                        OpCode::Text => {
                            let echo = Frame::data(OpCode::Text, true, frame.payload);
                            server.write_all(&super_encode_unmasked(&echo)).await.unwrap();
                        }
                        OpCode::Close => {
                            let reply = Frame::control(OpCode::Close, frame.payload);
                            server.write_all(&super_encode_unmasked(&reply)).await.unwrap();
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });

        let result = run(client, &config, ExtensionPipeline::default(), Vec::new(), |sender, mut inbox| async move {
            sender.text("hello").unwrap();
            let msg = inbox.recv().await.unwrap();
            assert_eq!(msg, Message::Text("hello".into()));
        })
        .await
        .unwrap();

        assert_eq!(result.map(|f| f.code), Some(CloseCode::NormalClosure));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_local_close_are_dropped_not_sent() {
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ClientConfig { extensions: Vec::new(), close_timeout: StdDuration::from_millis(50), ..ClientConfig::default() };

        let server_task = tokio::spawn(async move {
            let mut decoder = ServerSideDecoder::default();
            let mut buf = vec![0u8; 4096];
            let mut saw_text = false;
            loop {
                let n = server.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                decoder.feed(&buf[..n]);
                while let Some(frame) = decoder.decode_next() {
                    match frame.opcode {
                        OpCode::Text => saw_text = true,
                        OpCode::Close => {
                            let reply = Frame::control(OpCode::Close, frame.payload);
                            server.write_all(&super_encode_unmasked(&reply)).await.unwrap();
                            return saw_text;
                        }
                        _ => {}
                    }
                }
            }
            saw_text
        });

        run(client, &config, ExtensionPipeline::default(), Vec::new(), |sender, _inbox| async move {
            sender.close(CloseFrame::new(CloseCode::NormalClosure, None)).unwrap();
            // Queued after the close request; must never reach the wire.
            let _ = sender.text("too late");
        })
        .await
        .unwrap();

        let saw_text = server_task.await.unwrap();
        assert!(!saw_text, "a text frame sent after close() must be dropped");
    }

    #[tokio::test]
    async fn inbox_drains_and_closes_when_peer_initiates_close() {
        // A handler that drains the inbox with `while let Some(msg) = inbox.recv().await`
        // must see the channel end once the peer's close frame lands, rather than
        // hanging forever waiting on a sender `run()` never drops.
        let (client, mut server) = tokio::io::duplex(4096);
        let config = ClientConfig { extensions: Vec::new(), ..ClientConfig::default() };

        let server_task = tokio::spawn(async move {
            let greeting = Frame::data(OpCode::Text, true, b"hi".to_vec());
            server.write_all(&super_encode_unmasked(&greeting)).await.unwrap();

            let close = Frame::control(OpCode::Close, CloseFrame::new(CloseCode::NormalClosure, None).encode());
            server.write_all(&super_encode_unmasked(&close)).await.unwrap();

            let mut decoder = ServerSideDecoder::default();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = server.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                decoder.feed(&buf[..n]);
                while let Some(frame) = decoder.decode_next() {
                    if frame.opcode == OpCode::Close {
                        return;
                    }
                }
            }
        });

        let run_fut = run(client, &config, ExtensionPipeline::default(), Vec::new(), |_sender, mut inbox| async move {
            let mut received = Vec::new();
            while let Some(msg) = inbox.recv().await {
                received.push(msg);
            }
            assert_eq!(received, vec![Message::Text("hi".into())]);
        });

        time::timeout(StdDuration::from_secs(2), run_fut)
            .await
            .expect("run() must complete once the peer closes, not hang on the handler's inbox drain")
            .unwrap();

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn force_closes_transport_when_peer_never_echoes_close() {
        let (client, _server) = tokio::io::duplex(4096);
        let config = ClientConfig { close_timeout: StdDuration::from_millis(20), extensions: Vec::new(), ..ClientConfig::default() };

        let result = run(client, &config, ExtensionPipeline::default(), Vec::new(), |_sender, _inbox| async move {}).await.unwrap();
        // our own locally initiated close frame is still what gets returned
        assert_eq!(result.map(|f| f.code), Some(CloseCode::NormalClosure));
    }

    /// Decodes the masked frames a real client sends, the way a server's
    /// codec would — the mirror image of the production `FrameDecoder`,
    /// which runs in client mode and rejects masked frames.
    #[derive(Default)]
    struct ServerSideDecoder {
        buf: Vec<u8>,
    }

    impl ServerSideDecoder {
        fn feed(&mut self, bytes: &[u8]) {
            self.buf.extend_from_slice(bytes);
        }

        fn decode_next(&mut self) -> Option<Frame> {
            if self.buf.len() < 2 {
                return None;
            }
            let byte0 = self.buf[0];
            let byte1 = self.buf[1];
            let fin = byte0 & 0x80 != 0;
            let opcode = match byte0 & 0x0F {
                0x0 => OpCode::Continuation,
                0x1 => OpCode::Text,
                0x2 => OpCode::Binary,
                0x8 => OpCode::Close,
                0x9 => OpCode::Ping,
                0xA => OpCode::Pong,
                other => panic!("unexpected opcode in test server: {other}"),
            };
            assert!(byte1 & 0x80 != 0, "client frames must be masked");
            let len7 = byte1 & 0x7F;
            let mut header_len = 2usize;
            let payload_len: usize = if len7 <= 125 {
                len7 as usize
            } else if len7 == 126 {
                if self.buf.len() < 4 {
                    return None;
                }
                header_len += 2;
                u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
            } else {
                if self.buf.len() < 10 {
                    return None;
                }
                header_len += 8;
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&self.buf[2..10]);
                u64::from_be_bytes(len_bytes) as usize
            };
            if self.buf.len() < header_len + 4 {
                return None;
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[header_len..header_len + 4]);
            header_len += 4;
            let total_len = header_len + payload_len;
            if self.buf.len() < total_len {
                return None;
            }
            let mut payload = self.buf[header_len..total_len].to_vec();
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
            self.buf.drain(0..total_len);
            Some(Frame { fin, rsv1: false, rsv2: false, rsv3: false, opcode, payload })
        }
    }

    fn super_encode_unmasked(frame: &Frame) -> Vec<u8> {
        let mut byte0 = match frame.opcode {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        };
        if frame.fin {
            byte0 |= 0x80;
        }
        let mut out = vec![byte0];
        let len = frame.payload.len();
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
}
