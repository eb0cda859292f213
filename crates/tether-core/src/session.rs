//! Per-session state machine.
//!
//! [`SessionState`] holds everything the multiplexer knows about one logical
//! stream and performs no I/O. Each event method returns the follow-up
//! [`SessionAction`]s the caller must carry out, in order.
//!
//! Retirement (removal of the id from the session table) is driven by the
//! server side so that both ends never disagree about whether an id may be
//! reused:
//!
//! * the server retires when it sends CLOSE without ACK_REQUIRED, when it
//!   receives the acknowledgment for CLOSE|ACK_REQUIRED, or when it sends or
//!   answers an abort;
//! * the client retires when it receives CLOSE without ACK_REQUIRED, after it
//!   sends the acknowledgment, or when it receives an abort from the server.

use std::fmt;

use crate::error::MuxError;
use crate::flow_control::{InboundRation, OutboundRation};
use crate::framing::DataFlags;

/// Which end of a session this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated the session; answers the close handshake
    Client,
    /// Accepted the session; drives the close handshake
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    pub fn peer(&self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one direction of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// End of stream signalled (half-close)
    Finished,
    Terminated,
}

impl StreamState {
    /// Position in the lifecycle; states only ever move to a higher rank
    pub fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Open => 1,
            Self::Finished => 2,
            Self::Terminated => 3,
        }
    }

    pub fn is_before(self, other: Self) -> bool {
        self.rank() < other.rank()
    }

    /// Finished or terminated
    pub fn is_done(self) -> bool {
        !self.is_before(Self::Finished)
    }

    /// Move forward to `next`; backward moves are ignored
    fn advance(&mut self, next: Self) {
        if self.is_before(next) {
            *self = next;
        }
    }
}

/// Work the caller must perform after a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Remove the session id from the table
    Retire,
    /// Send an empty DATA frame carrying CLOSE (server only)
    SendClose { ack_required: bool },
    /// Send an ACKNOWLEDGMENT (client only)
    SendAck,
    /// Send an ABORT without a message
    SendAbort,
}

/// How a session ended, as seen by the layer above
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// At least one direction is still running
    Open,
    /// Both directions finished normally
    Completed,
    /// The peer aborted the session with an error message
    PeerError(String),
    Aborted { by_peer: bool },
    /// The connection failed underneath the session
    Failed(MuxError),
}

impl SessionOutcome {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// State of one multiplexed session
#[derive(Debug)]
pub struct SessionState {
    id: u32,
    role: Role,
    in_state: StreamState,
    out_state: StreamState,
    in_ration: InboundRation,
    out_ration: OutboundRation,
    /// Server asked for an acknowledgment before the id may be reused
    ack_requested: bool,
    sent_ack_required: bool,
    received_ack_required: bool,
    ack_sent: bool,
    ack_received: bool,
    close_sent: bool,
    close_received: bool,
    /// Reader saw EOF or gave up on the input
    eof_consumed: bool,
    input_closed: bool,
    /// Peer finished the session while our output was still open; further
    /// writes are accepted and dropped so the close still looks clean.
    fake_ok_to_write: bool,
    abort_sent: bool,
    retired: bool,
    down: Option<MuxError>,
}

impl SessionState {
    /// A session opened locally; both directions start idle
    pub fn new(id: u32, role: Role, in_ration: InboundRation, out_ration: OutboundRation) -> Self {
        Self {
            id,
            role,
            in_state: StreamState::Idle,
            out_state: StreamState::Idle,
            in_ration,
            out_ration,
            ack_requested: false,
            sent_ack_required: false,
            received_ack_required: false,
            ack_sent: false,
            ack_received: false,
            close_sent: false,
            close_received: false,
            eof_consumed: false,
            input_closed: false,
            fake_ok_to_write: false,
            abort_sent: false,
            retired: false,
            down: None,
        }
    }

    /// A session created by the peer's OPEN frame; both directions are open
    pub fn accepted(id: u32, in_ration: InboundRation, out_ration: OutboundRation) -> Self {
        let mut state = Self::new(id, Role::Server, in_ration, out_ration);
        state.in_state = StreamState::Open;
        state.out_state = StreamState::Open;
        state
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn in_state(&self) -> StreamState {
        self.in_state
    }

    pub fn out_state(&self) -> StreamState {
        self.out_state
    }

    pub fn in_ration(&self) -> &InboundRation {
        &self.in_ration
    }

    pub fn in_ration_mut(&mut self) -> &mut InboundRation {
        &mut self.in_ration
    }

    pub fn out_ration(&self) -> &OutboundRation {
        &self.out_ration
    }

    pub fn out_ration_mut(&mut self) -> &mut OutboundRation {
        &mut self.out_ration
    }

    pub fn down(&self) -> Option<&MuxError> {
        self.down.as_ref()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn fake_ok_to_write(&self) -> bool {
        self.fake_ok_to_write
    }

    pub fn input_closed(&self) -> bool {
        self.input_closed
    }

    pub fn ack_received(&self) -> bool {
        self.ack_received
    }

    /// Whether the peer may still send data that needs its ration returned.
    ///
    /// Still true after the consumer closed the input early: the data is
    /// discarded but the peer's writer must not stall.
    pub fn returns_credit(&self) -> bool {
        self.down.is_none()
            && !self.close_sent
            && !self.close_received
            && matches!(self.in_state, StreamState::Open | StreamState::Terminated)
    }

    /// Ask the client to acknowledge the session before its id is reused.
    pub fn request_ack(&mut self) -> Result<(), MuxError> {
        if self.role != Role::Server {
            return Err(MuxError::NotPermitted(
                "only the server side may require an acknowledgment",
            ));
        }
        if self.close_sent {
            return Err(MuxError::NotPermitted(
                "acknowledgment requested after the session was closed",
            ));
        }
        self.ack_requested = true;
        Ok(())
    }

    /// Flags for the next outgoing data frame.
    ///
    /// `final_chunk` marks the last frame of this direction. The returned
    /// actions (only ever [`SessionAction::Retire`]) must run before the
    /// frame is queued.
    pub fn outbound_flags(&mut self, final_chunk: bool) -> (DataFlags, Vec<SessionAction>) {
        let mut flags = DataFlags::empty();
        let mut actions = Vec::new();

        if self.out_state == StreamState::Idle {
            flags = flags.with(DataFlags::OPEN);
            self.out_state.advance(StreamState::Open);
            self.in_state.advance(StreamState::Open);
        }

        if final_chunk {
            flags = flags.with(DataFlags::EOF);
            self.out_state.advance(StreamState::Finished);
            if self.role == Role::Server && self.in_state.is_done() {
                let ack_required = self.mark_close_sent(&mut actions);
                flags = flags.with(DataFlags::CLOSE);
                if ack_required {
                    flags = flags.with(DataFlags::ACK_REQUIRED);
                }
            }
        }

        (flags, actions)
    }

    fn mark_close_sent(&mut self, actions: &mut Vec<SessionAction>) -> bool {
        self.close_sent = true;
        self.sent_ack_required = self.ack_requested;
        self.in_state.advance(StreamState::Terminated);
        self.out_state.advance(StreamState::Terminated);
        if !self.sent_ack_required || self.ack_received {
            self.retire(actions);
        }
        self.sent_ack_required
    }

    fn retire(&mut self, actions: &mut Vec<SessionAction>) {
        if !self.retired {
            self.retired = true;
            actions.push(SessionAction::Retire);
        }
    }

    /// Server: close the session if both directions are now done.
    fn maybe_close(&mut self, actions: &mut Vec<SessionAction>) {
        if self.role == Role::Server
            && !self.close_sent
            && self.down.is_none()
            && self.out_state == StreamState::Finished
            && self.in_state.is_done()
        {
            let ack_required = self.mark_close_sent(actions);
            actions.push(SessionAction::SendClose { ack_required });
        }
    }

    /// A DATA frame carrying `len` payload bytes arrived.
    ///
    /// Returns whether the payload should be queued for the reader, plus
    /// follow-up actions. An error is a protocol violation and fatal to the
    /// whole connection.
    pub fn on_data(
        &mut self,
        flags: DataFlags,
        len: usize,
    ) -> Result<(bool, Vec<SessionAction>), MuxError> {
        let mut actions = Vec::new();

        if flags.is_open() && self.role == Role::Client {
            return Err(self.violation("server set OPEN"));
        }
        if self.role == Role::Server && (flags.is_close() || flags.is_ack_required()) {
            return Err(self.violation("client set CLOSE or ACK_REQUIRED"));
        }
        if self.in_state == StreamState::Idle {
            return Err(self.violation("data before the session was opened"));
        }
        if self.in_state == StreamState::Finished && (len > 0 || flags.is_eof()) {
            return Err(self.violation("data after end of stream"));
        }
        if self.close_received {
            return Err(self.violation("data after CLOSE"));
        }

        self.in_ration
            .receive(len)
            .map_err(|err| self.violation(&err.to_string()))?;

        let deliver = len > 0
            && self.in_state == StreamState::Open
            && !self.input_closed
            && self.down.is_none();

        if flags.is_eof() {
            self.in_state.advance(StreamState::Finished);
            self.maybe_close(&mut actions);
        }

        if flags.is_close() {
            self.on_close(flags.is_ack_required(), &mut actions);
        }

        Ok((deliver, actions))
    }

    fn on_close(&mut self, ack_required: bool, actions: &mut Vec<SessionAction>) {
        self.close_received = true;
        self.received_ack_required = ack_required;
        self.in_state.advance(StreamState::Finished);
        if self.out_state == StreamState::Open {
            self.fake_ok_to_write = true;
        }
        self.out_state.advance(StreamState::Terminated);

        if !ack_required || self.ack_sent {
            self.retire(actions);
        } else if self.eof_consumed && self.down.is_none() {
            self.ack_sent = true;
            actions.push(SessionAction::SendAck);
            self.retire(actions);
        }
    }

    /// The peer granted more outbound credit
    pub fn on_increment(&mut self, amount: u32) -> Result<(), MuxError> {
        let result = self.out_ration.grant(amount);
        result.map_err(|err| self.violation(&err.to_string()))
    }

    /// The client acknowledged the session (server only)
    pub fn on_ack(&mut self) -> Result<Vec<SessionAction>, MuxError> {
        if self.role == Role::Client {
            return Err(self.violation("server sent an acknowledgment"));
        }
        let mut actions = Vec::new();
        self.ack_received = true;
        if self.close_sent && self.sent_ack_required {
            self.retire(&mut actions);
        }
        Ok(actions)
    }

    /// The peer aborted the session
    pub fn on_abort(&mut self, message: Option<String>) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let err = match message {
            Some(message) => MuxError::PeerError(message),
            None => MuxError::SessionAborted { by_peer: true },
        };
        self.set_down(err);

        if self.role == Role::Server && !self.abort_sent {
            self.abort_sent = true;
            self.retire(&mut actions);
            actions.push(SessionAction::SendAbort);
        } else {
            self.retire(&mut actions);
        }
        actions
    }

    /// Abort the session locally.
    ///
    /// The abort frame itself (which may carry a message) is sent by the
    /// caller when `true` is returned; any retirement comes first in the
    /// returned actions. After CLOSE has been sent or received no ABORT is
    /// sent: a server waiting for its ACK keeps the id, and a client that
    /// still owes the ACK sends it and retires.
    pub fn abort(&mut self) -> (bool, Vec<SessionAction>) {
        let mut actions = Vec::new();
        if self.retired || self.down.is_some() || self.out_state == StreamState::Idle {
            // Nothing on the wire refers to this session yet.
            if self.out_state == StreamState::Idle && self.down.is_none() {
                self.set_down(MuxError::SessionAborted { by_peer: false });
                self.retire(&mut actions);
            }
            return (false, actions);
        }
        if self.close_sent || self.close_received {
            // Once CLOSE is on the wire only an ACK may still name this id.
            self.set_down(MuxError::SessionAborted { by_peer: false });
            if self.role == Role::Client && self.received_ack_required && !self.ack_sent {
                self.ack_sent = true;
                actions.push(SessionAction::SendAck);
                self.retire(&mut actions);
            }
            return (false, actions);
        }
        self.set_down(MuxError::SessionAborted { by_peer: false });
        self.abort_sent = true;
        if self.role == Role::Server {
            self.retire(&mut actions);
        }
        (true, actions)
    }

    /// The consumer closed the input stream.
    pub fn close_input(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.input_closed {
            return actions;
        }
        self.input_closed = true;
        self.eof_consumed = true;
        if self.in_state == StreamState::Open {
            self.in_state.advance(StreamState::Terminated);
        }

        match self.role {
            Role::Client => {
                // A retired id may already belong to a new session.
                if !self.ack_sent
                    && !self.retired
                    && self.down.is_none()
                    && self.out_state != StreamState::Idle
                {
                    self.ack_sent = true;
                    actions.push(SessionAction::SendAck);
                }
                if self.close_received && (self.ack_sent || !self.received_ack_required) {
                    self.retire(&mut actions);
                }
            }
            Role::Server => self.maybe_close(&mut actions),
        }
        actions
    }

    /// The reader consumed the end of stream.
    pub fn eof_consumed(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.eof_consumed {
            return actions;
        }
        self.eof_consumed = true;
        if self.role == Role::Client
            && self.close_received
            && self.received_ack_required
            && !self.ack_sent
            && self.down.is_none()
        {
            self.ack_sent = true;
            actions.push(SessionAction::SendAck);
            self.retire(&mut actions);
        }
        actions
    }

    /// The connection failed; the session is finished for good.
    pub fn fail(&mut self, err: MuxError) {
        if self.retired && self.down.is_none() {
            return;
        }
        self.set_down(err);
        self.retired = true;
    }

    /// Mark the session down; the first error wins.
    pub fn set_down(&mut self, err: MuxError) {
        if self.down.is_none() {
            self.down = Some(err);
        }
        self.in_state.advance(StreamState::Terminated);
        self.out_state.advance(StreamState::Terminated);
    }

    pub fn outcome(&self) -> SessionOutcome {
        match &self.down {
            Some(MuxError::SessionAborted { by_peer }) => SessionOutcome::Aborted { by_peer: *by_peer },
            Some(MuxError::PeerError(message)) => SessionOutcome::PeerError(message.clone()),
            Some(err) => SessionOutcome::Failed(err.clone()),
            None if self.in_state.is_done() && self.out_state.is_done() => {
                SessionOutcome::Completed
            }
            None => SessionOutcome::Open,
        }
    }

    fn violation(&self, what: &str) -> MuxError {
        MuxError::Protocol(format!("session {}: {}", self.id, what))
    }
}
