//! Wire framing for the session multiplexer.
//!
//! Every frame starts with a one-byte opcode. Session ids, lengths and
//! amounts are protobuf-style varints:
//!
//! ```text
//! HELLO      0x01  "TMUX" version:u8 role:u8 initial_ration:varint
//! DATA       0x02  session:varint flags:u8 len:varint payload
//! INCREMENT  0x03  session:varint amount:varint
//! ACK        0x04  session:varint
//! ABORT      0x05  session:varint has_msg:u8 [len:varint utf8]
//! PING       0x06  cookie:varint
//! PING_ACK   0x07  cookie:varint
//! SHUTDOWN   0x08  len:varint utf8
//! ERROR      0x09  len:varint utf8
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::session::Role;

/// Maximum payload or message size carried by one frame (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Magic bytes opening every HELLO frame
pub const MAGIC: &[u8; 4] = b"TMUX";

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

const OP_HELLO: u8 = 0x01;
const OP_DATA: u8 = 0x02;
const OP_INCREMENT: u8 = 0x03;
const OP_ACK: u8 = 0x04;
const OP_ABORT: u8 = 0x05;
const OP_PING: u8 = 0x06;
const OP_PING_ACK: u8 = 0x07;
const OP_SHUTDOWN: u8 = 0x08;
const OP_ERROR: u8 = 0x09;

const ROLE_CLIENT: u8 = 0;
const ROLE_SERVER: u8 = 1;

const MAX_VARINT_LEN: usize = 10;

/// Data frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags(u8);

impl DataFlags {
    pub const OPEN: u8 = 0b0000_0001;
    pub const EOF: u8 = 0b0000_0010;
    pub const CLOSE: u8 = 0b0000_0100;
    pub const ACK_REQUIRED: u8 = 0b0000_1000;

    const ALL: u8 = Self::OPEN | Self::EOF | Self::CLOSE | Self::ACK_REQUIRED;

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_open(&self) -> bool {
        self.0 & Self::OPEN != 0
    }

    pub fn is_eof(&self) -> bool {
        self.0 & Self::EOF != 0
    }

    pub fn is_close(&self) -> bool {
        self.0 & Self::CLOSE != 0
    }

    pub fn is_ack_required(&self) -> bool {
        self.0 & Self::ACK_REQUIRED != 0
    }

    /// Return a copy with `flag` set
    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// A frame on the shared connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection header, exchanged once in each direction
    Hello {
        version: u8,
        role: Role,
        /// Initial inbound ration of the sender; 0 means unlimited
        initial_ration: u32,
    },
    Data {
        session: u32,
        flags: DataFlags,
        payload: Bytes,
    },
    IncrementRation {
        session: u32,
        amount: u32,
    },
    Acknowledgment {
        session: u32,
    },
    Abort {
        session: u32,
        message: Option<String>,
    },
    Ping {
        cookie: u64,
    },
    PingAck {
        cookie: u64,
    },
    Shutdown {
        message: String,
    },
    Error {
        message: String,
    },
}

impl Frame {
    /// Create a data frame
    pub fn data(session: u32, flags: DataFlags, payload: Bytes) -> Self {
        Self::Data {
            session,
            flags,
            payload,
        }
    }

    /// Session this frame belongs to, if any
    pub fn session(&self) -> Option<u32> {
        match self {
            Self::Data { session, .. }
            | Self::IncrementRation { session, .. }
            | Self::Acknowledgment { session }
            | Self::Abort { session, .. } => Some(*session),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Data { .. } => "data",
            Self::IncrementRation { .. } => "increment",
            Self::Acknowledgment { .. } => "ack",
            Self::Abort { .. } => "abort",
            Self::Ping { .. } => "ping",
            Self::PingAck { .. } => "ping_ack",
            Self::Shutdown { .. } => "shutdown",
            Self::Error { .. } => "error",
        }
    }

    /// Number of payload bytes carried by a data frame
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Length of everything preceding the payload of a data frame, or the
    /// whole frame for other kinds.
    pub fn header_len(&self) -> usize {
        self.encoded_len() - self.payload_len()
    }

    /// Exact number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Hello { initial_ration, .. } => {
                MAGIC.len() + 2 + varint_len(u64::from(*initial_ration))
            }
            Self::Data {
                session, payload, ..
            } => {
                varint_len(u64::from(*session))
                    + 1
                    + varint_len(payload.len() as u64)
                    + payload.len()
            }
            Self::IncrementRation { session, amount } => {
                varint_len(u64::from(*session)) + varint_len(u64::from(*amount))
            }
            Self::Acknowledgment { session } => varint_len(u64::from(*session)),
            Self::Abort { session, message } => {
                varint_len(u64::from(*session))
                    + 1
                    + message.as_ref().map_or(0, |m| string_len(m))
            }
            Self::Ping { cookie } | Self::PingAck { cookie } => varint_len(*cookie),
            Self::Shutdown { message } | Self::Error { message } => string_len(message),
        }
    }

    /// Encode this frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoding of this frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Hello {
                version,
                role,
                initial_ration,
            } => {
                buf.put_u8(OP_HELLO);
                buf.put_slice(MAGIC);
                buf.put_u8(*version);
                buf.put_u8(match role {
                    Role::Client => ROLE_CLIENT,
                    Role::Server => ROLE_SERVER,
                });
                encode_varint(u64::from(*initial_ration), buf);
            }
            Self::Data {
                session,
                flags,
                payload,
            } => {
                buf.put_u8(OP_DATA);
                encode_varint(u64::from(*session), buf);
                buf.put_u8(flags.as_u8());
                encode_varint(payload.len() as u64, buf);
                buf.put_slice(payload);
            }
            Self::IncrementRation { session, amount } => {
                buf.put_u8(OP_INCREMENT);
                encode_varint(u64::from(*session), buf);
                encode_varint(u64::from(*amount), buf);
            }
            Self::Acknowledgment { session } => {
                buf.put_u8(OP_ACK);
                encode_varint(u64::from(*session), buf);
            }
            Self::Abort { session, message } => {
                buf.put_u8(OP_ABORT);
                encode_varint(u64::from(*session), buf);
                match message {
                    Some(message) => {
                        buf.put_u8(1);
                        encode_string(message, buf);
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::Ping { cookie } => {
                buf.put_u8(OP_PING);
                encode_varint(*cookie, buf);
            }
            Self::PingAck { cookie } => {
                buf.put_u8(OP_PING_ACK);
                encode_varint(*cookie, buf);
            }
            Self::Shutdown { message } => {
                buf.put_u8(OP_SHUTDOWN);
                encode_string(message, buf);
            }
            Self::Error { message } => {
                buf.put_u8(OP_ERROR);
                encode_string(message, buf);
            }
        }
    }
}

/// Frame parser for decoding frames from a byte stream
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet parsed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse a complete frame from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. Nothing is consumed
    /// unless a whole frame is available.
    pub fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = &self.buffer[..];
        let frame = match parse_body(&mut cursor)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let consumed = self.buffer.len() - cursor.len();
        self.buffer.advance(consumed);
        Ok(Some(frame))
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid varint encoding")]
    InvalidVarint,

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Invalid data flags: {0:#010b}")]
    InvalidFlags(u8),

    #[error("Value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("Bad connection header: {0}")]
    BadHeader(&'static str),

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,
}

// Each `need!` bails out with Ok(None) when the buffer runs dry.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

fn parse_body(buf: &mut &[u8]) -> Result<Option<Frame>, FrameError> {
    let opcode = need!(take_u8(buf));
    let frame = match opcode {
        OP_HELLO => {
            if buf.len() < MAGIC.len() {
                return Ok(None);
            }
            if &buf[..MAGIC.len()] != MAGIC {
                return Err(FrameError::BadHeader("bad magic"));
            }
            buf.advance(MAGIC.len());
            let version = need!(take_u8(buf));
            let role = match need!(take_u8(buf)) {
                ROLE_CLIENT => Role::Client,
                ROLE_SERVER => Role::Server,
                _ => return Err(FrameError::BadHeader("unknown role")),
            };
            let initial_ration = to_u32("initial_ration", need!(decode_varint(buf)?))?;
            Frame::Hello {
                version,
                role,
                initial_ration,
            }
        }
        OP_DATA => {
            let session = to_u32("session", need!(decode_varint(buf)?))?;
            let flags = need!(take_u8(buf));
            if flags & !DataFlags::ALL != 0 {
                return Err(FrameError::InvalidFlags(flags));
            }
            let len = checked_len(need!(decode_varint(buf)?))?;
            if buf.len() < len {
                return Ok(None);
            }
            let payload = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Frame::Data {
                session,
                flags: DataFlags::new(flags),
                payload,
            }
        }
        OP_INCREMENT => {
            let session = to_u32("session", need!(decode_varint(buf)?))?;
            let amount = to_u32("amount", need!(decode_varint(buf)?))?;
            Frame::IncrementRation { session, amount }
        }
        OP_ACK => {
            let session = to_u32("session", need!(decode_varint(buf)?))?;
            Frame::Acknowledgment { session }
        }
        OP_ABORT => {
            let session = to_u32("session", need!(decode_varint(buf)?))?;
            let message = match need!(take_u8(buf)) {
                0 => None,
                1 => Some(need!(decode_string(buf)?)),
                _ => return Err(FrameError::BadHeader("bad abort message marker")),
            };
            Frame::Abort { session, message }
        }
        OP_PING => Frame::Ping {
            cookie: need!(decode_varint(buf)?),
        },
        OP_PING_ACK => Frame::PingAck {
            cookie: need!(decode_varint(buf)?),
        },
        OP_SHUTDOWN => Frame::Shutdown {
            message: need!(decode_string(buf)?),
        },
        OP_ERROR => Frame::Error {
            message: need!(decode_string(buf)?),
        },
        other => return Err(FrameError::UnknownOpcode(other)),
    };
    Ok(Some(frame))
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    if buf.has_remaining() {
        Some(buf.get_u8())
    } else {
        None
    }
}

fn to_u32(field: &'static str, value: u64) -> Result<u32, FrameError> {
    u32::try_from(value).map_err(|_| FrameError::OutOfRange { field, value })
}

fn checked_len(value: u64) -> Result<usize, FrameError> {
    match usize::try_from(value) {
        Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
        _ => Err(FrameError::FrameTooLarge(
            usize::try_from(value).unwrap_or(usize::MAX),
        )),
    }
}

fn encode_string(value: &str, buf: &mut BytesMut) {
    // Oversized messages are cut at a char boundary to stay under the cap.
    let mut end = value.len().min(MAX_FRAME_SIZE);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    encode_varint(end as u64, buf);
    buf.put_slice(&value.as_bytes()[..end]);
}

fn string_len(value: &str) -> usize {
    let mut end = value.len().min(MAX_FRAME_SIZE);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    varint_len(end as u64) + end
}

fn decode_string(buf: &mut &[u8]) -> Result<Option<String>, FrameError> {
    let len = checked_len(need!(decode_varint(buf)?))?;
    if buf.len() < len {
        return Ok(None);
    }
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::InvalidUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(Some(text))
}

/// Encode a u64 as a protobuf varint
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        if value < 0x80 {
            buf.put_u8(value as u8);
            break;
        } else {
            buf.put_u8(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }
}

/// Number of bytes `encode_varint` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode a protobuf varint
///
/// `Ok(None)` means the buffer ended mid-varint.
fn decode_varint<B: Buf>(buf: &mut B) -> Result<Option<u64>, FrameError> {
    let mut value = 0u64;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let byte = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(FrameError::InvalidVarint);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);

        if byte < 0x80 {
            return Ok(Some(value));
        }
    }

    Err(FrameError::InvalidVarint)
}
