//! Connection counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the mux engine
#[derive(Debug, Default)]
pub struct MuxStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    ration_increments_sent: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_retired: AtomicU64,
}

/// Point-in-time copy of [`MuxStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub ration_increments_sent: u64,
    pub sessions_opened: u64,
    pub sessions_retired: u64,
}

impl MuxStats {
    pub(crate) fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_increment(&self) {
        self.ration_increments_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self) {
        self.sessions_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            ration_increments_sent: self.ration_increments_sent.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_retired: self.sessions_retired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = MuxStats::default();
        stats.record_frame_sent(10);
        stats.record_frame_sent(5);
        stats.record_increment();
        stats.record_opened();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.ration_increments_sent, 1);
        assert_eq!(snapshot.sessions_opened, 1);
        assert_eq!(snapshot.sessions_retired, 0);
    }
}
