//! Completion handles for writes queued to the shared connection.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tether_core::MuxError;

/// A queued write that did not fully reach the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("write failed after {transmitted} payload bytes: {error}")]
pub struct IoFailure {
    /// Payload bytes handed to the connection before it failed
    pub transmitted: usize,
    pub error: MuxError,
}

/// Completion handle for one frame queued on the writer.
///
/// Resolves to the number of payload bytes written, so a sender never
/// mistakes a write cut short by a connection failure for a complete one.
#[derive(Debug, Default)]
pub struct IoFuture {
    result: Mutex<Option<Result<usize, IoFailure>>>,
    done: Condvar,
}

impl IoFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn complete(&self, transmitted: usize) {
        self.resolve(Ok(transmitted));
    }

    pub(crate) fn fail(&self, transmitted: usize, error: MuxError) {
        self.resolve(Err(IoFailure { transmitted, error }));
    }

    fn resolve(&self, result: Result<usize, IoFailure>) {
        // The slot is plain data, so a poisoned lock is still usable.
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
        }
        self.done.notify_all();
    }

    /// Whether the write has been resolved
    pub fn is_done(&self) -> bool {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Block until the write completes or fails
    pub fn wait(&self) -> Result<usize, IoFailure> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<usize, IoFailure>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
