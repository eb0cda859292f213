//! Flow-controlled writer side of a session.

use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, trace};

use tether_core::{Frame, MuxError, Role};

use crate::session::{Guard, SessionShared};

/// Writes bytes to the peer on one session.
///
/// Writes collect in a buffer of `max_fragment_size` bytes. A full buffer,
/// `flush` or `close` sends it as data frames, blocking while the session
/// has no outbound ration left.
pub struct SessionOutput {
    shared: Arc<SessionShared>,
}

impl SessionOutput {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn session_id(&self) -> u32 {
        self.shared.id
    }

    /// Bytes buffered but not yet sent
    pub fn pending(&self) -> usize {
        self.shared
            .lock()
            .map(|guard| guard.out_buf.len())
            .unwrap_or(0)
    }

    /// Flush everything and signal end of stream to the peer.
    pub fn close(&self) -> Result<(), MuxError> {
        self.shared.close_output()
    }
}

impl Write for SessionOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.write(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.flush().map_err(io::Error::from)
    }
}

impl SessionShared {
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
        let mut guard = self.lock()?;
        if guard.out_closed {
            return Err(MuxError::StreamClosed);
        }
        let capacity = self.mux.config.max_fragment_size;

        let mut written = 0;
        while written < data.len() {
            if let Some(err) = guard.state.down() {
                return Err(err.clone());
            }
            if guard.state.fake_ok_to_write() {
                trace!(session = self.id, len = data.len() - written, "discarding write after peer close");
                return Ok(data.len());
            }
            let room = capacity.saturating_sub(guard.out_buf.len());
            if room == 0 {
                guard = self.flush_locked(guard, false)?;
                continue;
            }
            let n = room.min(data.len() - written);
            guard.out_buf.extend_from_slice(&data[written..written + n]);
            written += n;
        }
        Ok(written)
    }

    pub(crate) fn flush(&self) -> Result<(), MuxError> {
        let guard = self.lock()?;
        if guard.out_closed {
            return Ok(());
        }
        self.flush_locked(guard, false).map(drop)
    }

    pub(crate) fn close_output(&self) -> Result<(), MuxError> {
        let mut guard = self.lock()?;
        if guard.out_closed {
            return Ok(());
        }
        guard.out_closed = true;
        if let Some(err) = guard.state.down() {
            // Closing after our own abort is not an error.
            return match err {
                MuxError::SessionAborted { by_peer: false } => Ok(()),
                err => Err(err.clone()),
            };
        }
        let result = self.flush_locked(guard, true);
        self.notify();
        debug!(session = self.id, role = %self.role, ok = result.is_ok(), "output closed");
        result.map(drop)
    }

    /// Send buffered data as ration allows, blocking when there is none.
    ///
    /// Returns once the buffer is empty, or with `closing`, once the final
    /// frame of this direction has been sent.
    fn flush_locked<'a>(&'a self, mut guard: Guard<'a>, closing: bool) -> Result<Guard<'a>, MuxError> {
        loop {
            let inner = &mut *guard;
            if let Some(err) = inner.state.down() {
                return Err(err.clone());
            }
            if inner.state.fake_ok_to_write() {
                inner.out_buf.clear();
                return Ok(guard);
            }

            let pending = inner.out_buf.len();
            let finishing = closing && !inner.state.out_state().is_done();
            if pending == 0 && !finishing {
                return Ok(guard);
            }

            let allowed = inner.state.out_ration().admit(pending);
            if allowed == 0 && pending > 0 {
                trace!(session = self.id, pending, "waiting for ration");
                guard = self.wait(guard)?;
                continue;
            }

            // The frame takes ownership of a frozen copy; the staging
            // buffer keeps accepting writes.
            let chunk = inner.out_buf.split_to(allowed).freeze();
            inner.state.out_ration_mut().consume(allowed);
            let final_chunk = finishing && inner.out_buf.is_empty();
            let (flags, actions) = inner.state.outbound_flags(final_chunk);
            self.apply(actions);
            let frame = Frame::data(self.id, flags, chunk);

            if final_chunk && self.role == Role::Server {
                // Delivered before the caller proceeds, so process exit
                // cannot overtake the end of the response.
                let future = self.mux.send_sync(frame)?;
                drop(guard);
                let result = future.wait();
                let guard = self.lock()?;
                return match result {
                    Ok(_) => Ok(guard),
                    Err(failure) => {
                        debug!(session = self.id, transmitted = failure.transmitted, "final frame cut short");
                        Err(failure.error)
                    }
                };
            }

            self.mux.send(frame)?;
            if final_chunk {
                return Ok(guard);
            }
        }
    }
}
