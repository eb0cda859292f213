//! Core types for the tether session multiplexer.
//!
//! This crate holds the I/O-free parts shared by the mux engine:
//! - Wire framing (opcodes, varints, incremental frame parsing)
//! - The per-session state machine and close handshake
//! - Ration (credit) based flow control
//! - Error and configuration types

pub mod config;
pub mod error;
pub mod flow_control;
pub mod framing;
pub mod session;

pub use config::MuxConfig;
pub use error::{MuxError, Result};
pub use flow_control::{InboundRation, OutboundRation, RationError, DEFAULT_INITIAL_RATION};
pub use framing::{DataFlags, Frame, FrameError, FrameParser, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use session::{Role, SessionAction, SessionOutcome, SessionState, StreamState};
