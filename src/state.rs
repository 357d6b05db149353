//! The connection state machine (spec §4.4): an explicit `(state, input) ->
//! (state, action)` step function. `ConnectionCore` is the only caller —
//! this module has no I/O of its own, matching the "state machine as
//! explicit enum, avoid hidden side effects" design note.

use std::time::{Duration, Instant};

use rand::RngCore;

use crate::close::{CloseCode, CloseFrame};

/// What the caller (`ConnectionCore`) should do in response to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendClose(CloseFrame),
    SendPing(Vec<u8>),
    SendPong(Vec<u8>),
    CloseConnection(CloseCode),
    /// Nothing to send; an outstanding ping is still within its period.
    Wait,
    /// The auto-ping timer should stop rescheduling itself.
    Stop,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

/// Tracks connection lifecycle and the one outstanding ping. Per spec §5,
/// this is the only shared mutable state in a connection; a single-context
/// (or mutex-guarded) owner is all synchronization it needs.
pub struct StateMachine {
    state: ConnState,
    /// The first-seen close frame settles here, whichever side closed
    /// first; a later close from the other side never overwrites it.
    close_frame: Option<CloseFrame>,
    outstanding_ping: Option<(Vec<u8>, Instant)>,
    /// Reused rather than reallocated on every ping (spec §4.4's invariant).
    ping_buffer: [u8; 16],
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine { state: ConnState::Open, close_frame: None, outstanding_ping: None, ping_buffer: [0u8; 16] }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.close_frame.as_ref()
    }

    pub fn can_send_user_data(&self) -> bool {
        matches!(self.state, ConnState::Open)
    }

    /// A local `close()` call.
    pub fn close(&mut self, frame: CloseFrame) -> Action {
        match self.state {
            ConnState::Open => {
                self.state = ConnState::Closing;
                self.close_frame = Some(frame.clone());
                Action::SendClose(frame)
            }
            ConnState::Closing | ConnState::Closed => Action::None,
        }
    }

    /// A close frame arrived from the peer.
    pub fn received_close(&mut self, peer_frame: CloseFrame) -> Action {
        match self.state {
            ConnState::Open => {
                self.close_frame = Some(peer_frame);
                self.state = ConnState::Closed;
                Action::SendClose(CloseFrame::new(CloseCode::NormalClosure, None))
            }
            ConnState::Closing => {
                // Keep our own close_frame (first-seen wins); just echo's
                // already on the wire from when we called close().
                self.state = ConnState::Closed;
                Action::None
            }
            ConnState::Closed => Action::None,
        }
    }

    pub fn received_ping(&mut self, data: Vec<u8>) -> Action {
        match self.state {
            ConnState::Open => Action::SendPong(data),
            ConnState::Closing | ConnState::Closed => Action::None,
        }
    }

    pub fn received_pong(&mut self, data: &[u8]) {
        if let Some((outstanding, _)) = &self.outstanding_ping {
            if outstanding.as_slice() == data {
                self.outstanding_ping = None;
            }
        }
    }

    /// One tick of the auto-ping timer.
    pub fn auto_ping_tick(&mut self, period: Duration) -> Action {
        match self.state {
            ConnState::Open => match &self.outstanding_ping {
                None => {
                    rand::thread_rng().fill_bytes(&mut self.ping_buffer);
                    let data = self.ping_buffer.to_vec();
                    self.outstanding_ping = Some((data.clone(), Instant::now()));
                    Action::SendPing(data)
                }
                Some((_, sent_at)) => {
                    if sent_at.elapsed() < period {
                        Action::Wait
                    } else {
                        Action::CloseConnection(CloseCode::UnexpectedServerError)
                    }
                }
            },
            ConnState::Closing | ConnState::Closed => Action::Stop,
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
