//! Flow control for multiplexed sessions.
//!
//! Credit ("ration") based flow control bounds how many bytes a sender may
//! put on the wire for one session before the receiver grants more. Each
//! direction of a session carries its own ration, independent of the flow
//! control of the underlying connection.

/// Default initial ration granted to the peer for each session (32KB)
pub const DEFAULT_INITIAL_RATION: u32 = 32 * 1024;

/// Sending side of a session's ration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundRation {
    /// Bytes that may still be sent
    Limited(u32),
    /// The peer applies no backpressure.
    ///
    /// Nothing then bounds the writer's outgoing frame queue: a sender
    /// faster than the connection grows it until the transport catches up.
    /// Only advertise unlimited ration to peers whose writers are trusted.
    Unlimited,
}

impl OutboundRation {
    /// Ration advertised by the peer; zero means unlimited
    pub fn from_advertised(initial: u32) -> Self {
        if initial == 0 {
            Self::Unlimited
        } else {
            Self::Limited(initial)
        }
    }

    /// How many of `wanted` bytes may be sent right now
    pub fn admit(&self, wanted: usize) -> usize {
        match self {
            Self::Limited(credit) => wanted.min(*credit as usize),
            Self::Unlimited => wanted,
        }
    }

    /// Record that `sent` bytes went out
    ///
    /// Callers only ever pass what [`admit`](Self::admit) returned.
    pub fn consume(&mut self, sent: usize) {
        if let Self::Limited(credit) = self {
            *credit = credit.saturating_sub(u32::try_from(sent).unwrap_or(u32::MAX));
        }
    }

    /// Add credit granted by the peer
    pub fn grant(&mut self, amount: u32) -> Result<(), RationError> {
        match self {
            Self::Limited(credit) => {
                *credit = credit
                    .checked_add(amount)
                    .ok_or(RationError::Overflow(amount))?;
                Ok(())
            }
            Self::Unlimited => Err(RationError::UnexpectedIncrement),
        }
    }

    /// Remaining credit, `None` when unlimited
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Self::Limited(credit) => Some(*credit),
            Self::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// Receiving side of a session's ration.
///
/// Tracks how much credit the peer still holds and decides when to top it
/// back up. Replenishment only happens once the bytes the peer could still
/// have in flight plus those queued locally drop to half the initial
/// ration, which batches increments instead of sending one per read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundRation {
    initial: u32,
    /// Credit currently held by the peer; unused when unlimited
    credit: u32,
}

impl InboundRation {
    /// `initial == 0` disables inbound flow control
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            credit: initial,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.initial == 0
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Credit the peer still holds, `None` when unlimited
    pub fn credit(&self) -> Option<u32> {
        (!self.is_unlimited()).then_some(self.credit)
    }

    /// Account for `len` bytes arriving from the peer
    pub fn receive(&mut self, len: usize) -> Result<(), RationError> {
        if self.is_unlimited() || len == 0 {
            return Ok(());
        }
        match u32::try_from(len) {
            Ok(len) if len <= self.credit => {
                self.credit -= len;
                Ok(())
            }
            _ => Err(RationError::Exceeded {
                received: len,
                credit: self.credit,
            }),
        }
    }

    /// Decide whether to grant more credit given `buffered` unread bytes
    ///
    /// Returns the increment to send, already added to the tracked credit.
    pub fn replenish(&mut self, buffered: usize) -> Option<u32> {
        if self.is_unlimited() {
            return None;
        }
        let used = u64::from(self.credit) + buffered as u64;
        if used > u64::from(self.initial / 2) {
            return None;
        }
        // used <= initial / 2, so the difference fits and is positive.
        let increment = self.initial - used as u32;
        self.credit += increment;
        Some(increment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RationError {
    #[error("peer sent {received} bytes with only {credit} bytes of ration")]
    Exceeded { received: usize, credit: u32 },

    #[error("ration increment of {0} overflows")]
    Overflow(u32),

    #[error("ration increment on an unlimited session")]
    UnexpectedIncrement,
}
