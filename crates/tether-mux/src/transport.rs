//! The raw byte connection underneath the multiplexer.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A bidirectional byte stream with no framing of its own.
///
/// The mux needs three independent handles to the same connection: one for
/// the read loop, one for the writer, and one to tear the connection down
/// from any thread.
pub trait Transport: Read + Write + Send + Sized + 'static {
    /// Another handle to the same underlying connection
    fn duplicate(&self) -> io::Result<Self>;

    /// Close both directions, unblocking any pending read
    fn close_transport(&self) -> io::Result<()>;

    /// Bound blocking reads; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Peer description for logs
    fn peer_label(&self) -> String {
        "unknown".to_string()
    }
}

impl Transport for TcpStream {
    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn close_transport(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string())
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn close_transport(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn peer_label(&self) -> String {
        "unix".to_string()
    }
}
