//! Sessions as seen by the layer above the mux.
//!
//! Each session owns one lock shared by its input and output sides, so
//! distinct sessions never contend with each other, and blocking waits on
//! one side release the lock for the other.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use tether_core::{DataFlags, Frame, MuxError, Role, SessionAction, SessionOutcome, SessionState};

use crate::input::SessionInput;
use crate::mux::MuxCore;
use crate::output::SessionOutput;

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    /// Received chunks not yet read, oldest first
    pub(crate) queue: VecDeque<Bytes>,
    pub(crate) buffered: usize,
    /// Output staging buffer, at most `max_fragment_size` bytes
    pub(crate) out_buf: BytesMut,
    pub(crate) out_closed: bool,
}

pub(crate) struct SessionShared {
    pub(crate) id: u32,
    pub(crate) role: Role,
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) changed: Condvar,
    pub(crate) mux: Arc<MuxCore>,
}

pub(crate) type Guard<'a> = MutexGuard<'a, SessionInner>;

impl SessionShared {
    pub(crate) fn new(state: SessionState, mux: Arc<MuxCore>) -> Self {
        let capacity = mux.config.max_fragment_size;
        Self {
            id: state.id(),
            role: state.role(),
            inner: Mutex::new(SessionInner {
                state,
                queue: VecDeque::new(),
                buffered: 0,
                out_buf: BytesMut::with_capacity(capacity),
                out_closed: false,
            }),
            changed: Condvar::new(),
            mux,
        }
    }

    /// A poisoned session lock fails this session only.
    pub(crate) fn lock(&self) -> Result<Guard<'_>, MuxError> {
        self.inner
            .lock()
            .map_err(|_| MuxError::Interrupted(format!("session {} lock poisoned", self.id)))
    }

    /// Release the lock until the session changes or the liveness period
    /// passes; callers re-check their condition either way.
    pub(crate) fn wait<'a>(&self, guard: Guard<'a>) -> Result<Guard<'a>, MuxError> {
        let interval = self.mux.config.liveness_interval_duration();
        match self.changed.wait_timeout(guard, interval) {
            Ok((guard, _)) => Ok(guard),
            Err(_) => Err(MuxError::Interrupted(format!(
                "wait on session {} interrupted",
                self.id
            ))),
        }
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Carry out follow-up actions from the state machine, in order.
    pub(crate) fn apply(&self, actions: Vec<SessionAction>) {
        for action in actions {
            let result = match action {
                SessionAction::Retire => {
                    self.mux.retire(self.id, self);
                    Ok(())
                }
                SessionAction::SendClose { ack_required } => {
                    let mut flags = DataFlags::new(DataFlags::CLOSE);
                    if ack_required {
                        flags = flags.with(DataFlags::ACK_REQUIRED);
                    }
                    self.mux.send(Frame::data(self.id, flags, Bytes::new()))
                }
                SessionAction::SendAck => self.mux.send(Frame::Acknowledgment { session: self.id }),
                SessionAction::SendAbort => self.mux.send(Frame::Abort {
                    session: self.id,
                    message: None,
                }),
            };
            if let Err(err) = result {
                trace!(session = self.id, ?action, error = %err, "follow-up frame not sent");
            }
        }
    }

    /// Credit the peer back once the reader has drained enough.
    pub(crate) fn replenish(&self, inner: &mut SessionInner) {
        if !inner.state.returns_credit() {
            return;
        }
        let buffered = inner.buffered;
        if let Some(amount) = inner.state.in_ration_mut().replenish(buffered) {
            trace!(session = self.id, amount, buffered, "granting ration");
            self.mux.stats.record_increment();
            if let Err(err) = self.mux.send(Frame::IncrementRation {
                session: self.id,
                amount,
            }) {
                trace!(session = self.id, error = %err, "increment not sent");
            }
        }
    }

    pub(crate) fn on_data(&self, flags: DataFlags, payload: Bytes) -> Result<(), MuxError> {
        let Ok(mut guard) = self.lock() else {
            return Ok(());
        };
        let inner = &mut *guard;
        let len = payload.len();
        let (deliver, actions) = inner.state.on_data(flags, len)?;
        if deliver {
            inner.buffered += len;
            inner.queue.push_back(payload);
        } else if len > 0 {
            // Discarded input still has to hand its ration back.
            self.replenish(inner);
        }
        if flags.is_eof() || flags.is_close() {
            debug!(session = self.id, role = %self.role, eof = flags.is_eof(), close = flags.is_close(), "peer finished sending");
        }
        self.apply(actions);
        drop(guard);
        self.notify();
        Ok(())
    }

    pub(crate) fn on_increment(&self, amount: u32) -> Result<(), MuxError> {
        let Ok(mut guard) = self.lock() else {
            return Ok(());
        };
        guard.state.on_increment(amount)?;
        drop(guard);
        self.notify();
        Ok(())
    }

    pub(crate) fn on_ack(&self) -> Result<(), MuxError> {
        let Ok(mut guard) = self.lock() else {
            return Ok(());
        };
        debug!(session = self.id, "acknowledgment received");
        let actions = guard.state.on_ack()?;
        self.apply(actions);
        drop(guard);
        self.notify();
        Ok(())
    }

    pub(crate) fn on_abort(&self, message: Option<String>) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        debug!(session = self.id, role = %self.role, ?message, "session aborted by peer");
        let actions = guard.state.on_abort(message);
        guard.queue.clear();
        guard.buffered = 0;
        self.apply(actions);
        drop(guard);
        self.notify();
    }

    /// Connection-level failure
    pub(crate) fn fail(&self, err: &MuxError) {
        if let Ok(mut guard) = self.lock() {
            guard.state.fail(err.clone());
        }
        self.notify();
    }

    pub(crate) fn abort(&self, message: Option<String>) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        let (send, actions) = guard.state.abort();
        // Any retirement has to precede the frame so the id is never reused early.
        self.apply(actions);
        if send {
            debug!(session = self.id, role = %self.role, "aborting session");
            if let Err(err) = self.mux.send(Frame::Abort {
                session: self.id,
                message,
            }) {
                trace!(session = self.id, error = %err, "abort not sent");
            }
        }
        guard.queue.clear();
        guard.buffered = 0;
        guard.out_buf.clear();
        drop(guard);
        self.notify();
    }
}

/// One logical, bidirectional, flow-controlled stream on a [`Mux`](crate::Mux).
///
/// Obtain byte streams with [`input`](Self::input) and
/// [`output`](Self::output). A session keeps its id reserved until it is
/// closed or aborted, so every session must end with [`close`](Self::close)
/// or [`abort`](Self::abort).
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Blocking reader over the data the peer sends on this session
    pub fn input(&self) -> SessionInput {
        SessionInput::new(self.shared.clone())
    }

    /// Blocking, flow-controlled writer to the peer
    pub fn output(&self) -> SessionOutput {
        SessionOutput::new(self.shared.clone())
    }

    /// Require the client to acknowledge the end of the session before its
    /// id may be reused. Server side only, before the output is closed.
    pub fn require_acknowledgment(&self) -> Result<(), MuxError> {
        self.shared.lock()?.state.request_ack()
    }

    /// Whether the client has acknowledged the session (server side)
    pub fn acknowledged(&self) -> bool {
        self.shared
            .lock()
            .map(|guard| guard.state.ack_received())
            .unwrap_or(false)
    }

    /// Close both directions: flush and finish the output, drop unread input.
    pub fn close(&self) -> Result<(), MuxError> {
        match self.shared.role {
            // The server closes its input first so the final data frame
            // can carry CLOSE.
            Role::Server => {
                self.shared.close_input();
                self.shared.close_output()
            }
            Role::Client => {
                let result = self.shared.close_output();
                self.shared.close_input();
                result
            }
        }
    }

    /// Abort the session, optionally reporting an error message to the peer.
    pub fn abort(&self, message: Option<&str>) {
        self.shared.abort(message.map(str::to_owned));
    }

    /// How the session ended so far
    pub fn outcome(&self) -> SessionOutcome {
        match self.shared.lock() {
            Ok(guard) => guard.state.outcome(),
            Err(err) => SessionOutcome::Failed(err),
        }
    }

    /// Whether the session id has been released
    pub fn is_retired(&self) -> bool {
        self.shared
            .lock()
            .map(|guard| guard.state.is_retired())
            .unwrap_or(true)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}
