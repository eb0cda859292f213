//! Blocking reader side of a session.

use bytes::Buf;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

use tether_core::MuxError;

use crate::session::SessionShared;

/// Reads the bytes the peer writes on one session, in order.
///
/// `read` blocks until data arrives, the peer finishes its side (returns
/// `Ok(0)`), or the session fails. Draining the queue hands ration back to
/// the peer once at least half of it is free again.
pub struct SessionInput {
    shared: Arc<SessionShared>,
}

impl SessionInput {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn session_id(&self) -> u32 {
        self.shared.id
    }

    /// Bytes received and waiting to be read
    pub fn available(&self) -> usize {
        self.shared.lock().map(|guard| guard.buffered).unwrap_or(0)
    }

    /// Stop reading. Unread and future data is discarded.
    pub fn close(&self) {
        self.shared.close_input();
    }
}

impl Read for SessionInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(buf).map_err(io::Error::from)
    }
}

impl SessionShared {
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        let mut guard = self.lock()?;
        loop {
            let inner = &mut *guard;
            if inner.state.input_closed() {
                return Err(MuxError::StreamClosed);
            }

            if let Some(front) = inner.queue.front_mut() {
                if buf.is_empty() {
                    return Ok(0);
                }
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    inner.queue.pop_front();
                }
                inner.buffered -= n;
                self.replenish(inner);
                return Ok(n);
            }

            if inner.state.down().is_none() && inner.state.in_state().is_done() {
                let actions = inner.state.eof_consumed();
                self.apply(actions);
                return Ok(0);
            }

            if let Some(err) = inner.state.down() {
                return Err(err.clone());
            }

            guard = self.wait(guard)?;
        }
    }

    pub(crate) fn close_input(&self) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        let inner = &mut *guard;
        if inner.state.input_closed() {
            return;
        }
        let discarded = inner.buffered;
        inner.queue.clear();
        inner.buffered = 0;
        let actions = inner.state.close_input();
        debug!(session = self.id, role = %self.role, discarded, "input closed");
        self.apply(actions);
        self.replenish(inner);
        drop(guard);
        self.notify();
    }
}
