//! Error types shared by every layer of the multiplexer.

use std::io;
use std::sync::Arc;

use crate::framing::FrameError;

/// Tether error type
///
/// Cloneable so that a single connection failure can be stored on every
/// session multiplexed over that connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Peer shut down the connection: {0}")]
    PeerShutdown(String),

    #[error("Peer reported a protocol error: {0}")]
    PeerProtocol(String),

    #[error("Connection shut down locally: {0}")]
    Shutdown(String),

    #[error("Session aborted{}", abort_suffix(.by_peer))]
    SessionAborted { by_peer: bool },

    #[error("Peer reported an error: {0}")]
    PeerError(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("No free session id (limit {0})")]
    TooManySessions(u32),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Wait interrupted: {0}")]
    Interrupted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(&'static str),
}

fn abort_suffix(by_peer: &bool) -> &'static str {
    if *by_peer {
        " by peer"
    } else {
        ""
    }
}

impl MuxError {
    /// Whether this error describes the whole connection going away rather
    /// than a single session ending.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::Framing(_)
                | Self::Handshake(_)
                | Self::ConnectionClosed
                | Self::PeerShutdown(_)
                | Self::PeerProtocol(_)
                | Self::Shutdown(_)
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io(err) => err.kind(),
            Self::ConnectionClosed | Self::PeerShutdown(_) | Self::Shutdown(_) => {
                io::ErrorKind::ConnectionAborted
            }
            Self::SessionAborted { .. } | Self::PeerError(_) => io::ErrorKind::ConnectionReset,
            Self::StreamClosed => io::ErrorKind::BrokenPipe,
            Self::Timeout(_) => io::ErrorKind::TimedOut,
            Self::Protocol(_) | Self::Framing(_) | Self::Handshake(_) | Self::PeerProtocol(_) => {
                io::ErrorKind::InvalidData
            }
            // Not ErrorKind::Interrupted: read_exact and write_all retry those.
            Self::Interrupted(_)
            | Self::TooManySessions(_)
            | Self::InvalidConfig(_)
            | Self::NotPermitted(_) => {
                io::ErrorKind::Other
            }
        }
    }
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        // Unwrap errors that already carry a MuxError so they are not nested.
        if err.get_ref().is_some_and(|inner| inner.is::<MuxError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(mux) = inner.downcast::<MuxError>() {
                    return *mux;
                }
            }
            return Self::Io(Arc::new(io::Error::other("unrecoverable wrapped error")));
        }
        Self::Io(Arc::new(err))
    }
}

impl From<FrameError> for MuxError {
    fn from(err: FrameError) -> Self {
        Self::Framing(err.to_string())
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

pub type Result<T, E = MuxError> = std::result::Result<T, E>;
