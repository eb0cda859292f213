//! Session multiplexer engine.
//!
//! This crate runs many sessions over one byte connection:
//! - [`Mux`]: handshake, read loop, serialized writer, session table
//! - [`Session`] with blocking [`SessionInput`] / [`SessionOutput`] streams
//! - [`IoFuture`] completion handles for queued writes
//! - The [`Transport`] seam for the connection underneath
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//! use tether_mux::{Mux, MuxConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mux = Mux::client(TcpStream::connect("127.0.0.1:7070")?, MuxConfig::default())?;
//! let session = mux.open_session()?;
//! session.output().write_all(b"hello")?;
//! session.output().close()?;
//!
//! let mut reply = Vec::new();
//! session.input().read_to_end(&mut reply)?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

mod input;
mod io_future;
mod mux;
mod output;
mod session;
mod stats;
mod transport;

pub use input::SessionInput;
pub use io_future::{IoFailure, IoFuture};
pub use mux::Mux;
pub use output::SessionOutput;
pub use session::Session;
pub use stats::{MuxStats, StatsSnapshot};
pub use transport::Transport;

pub use tether_core::{MuxConfig, MuxError, Role, SessionOutcome};
