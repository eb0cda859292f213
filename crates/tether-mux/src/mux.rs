//! The mux engine.
//!
//! One [`Mux`] owns one shared connection. A reader thread parses frames and
//! dispatches them to sessions by id; a writer thread is the single point
//! through which every session's frames reach the connection, in the order
//! they were queued.
//!
//! Any I/O error, malformed frame or protocol violation is fatal to every
//! session on the connection: once framing is lost there is no way to
//! resynchronise the byte stream.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use tether_core::{
    DataFlags, Frame, FrameParser, InboundRation, MuxConfig, MuxError, OutboundRation, Role,
    SessionState, PROTOCOL_VERSION,
};

use crate::io_future::IoFuture;
use crate::session::{Session, SessionShared};
use crate::stats::{MuxStats, StatsSnapshot};
use crate::transport::Transport;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a failing read loop waits for its ERROR frame to go out
const ERROR_FRAME_GRACE: Duration = Duration::from_millis(250);

struct Outgoing {
    frame: Frame,
    future: Option<Arc<IoFuture>>,
}

impl Drop for Outgoing {
    // Frames dropped unwritten (writer gone, queue discarded) must not leave
    // a sender blocked on the future.
    fn drop(&mut self) {
        if let Some(future) = &self.future {
            future.fail(0, MuxError::ConnectionClosed);
        }
    }
}

struct SessionTable {
    sessions: HashMap<u32, Arc<SessionShared>>,
    down: Option<MuxError>,
}

#[derive(Default)]
struct PingState {
    next_cookie: u64,
    outstanding: HashSet<u64>,
    answered: HashSet<u64>,
}

type Closer = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

pub(crate) struct MuxCore {
    pub(crate) role: Role,
    pub(crate) config: MuxConfig,
    /// Ration the peer grants each session, from its connection header
    peer_ration: u32,
    peer: String,
    table: Mutex<SessionTable>,
    outgoing: Mutex<Option<Sender<Outgoing>>>,
    accepted: Mutex<VecDeque<Session>>,
    accept_ready: Condvar,
    pings: Mutex<PingState>,
    ping_ready: Condvar,
    pub(crate) stats: MuxStats,
    closer: Closer,
}

// The table, queues and ping bookkeeping stay consistent across a panic, so
// a poisoned lock is recovered rather than propagated.
fn relock<'a, T>(result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

fn wait_on<'a, T>(ready: &Condvar, guard: MutexGuard<'a, T>, timeout: Duration) -> MutexGuard<'a, T> {
    match ready.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

impl MuxCore {
    fn lock_table(&self) -> MutexGuard<'_, SessionTable> {
        relock(self.table.lock())
    }

    pub(crate) fn is_down(&self) -> bool {
        self.lock_table().down.is_some()
    }

    pub(crate) fn down_error(&self) -> MuxError {
        self.lock_table()
            .down
            .clone()
            .unwrap_or(MuxError::ConnectionClosed)
    }

    /// Queue a frame for the writer
    pub(crate) fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.enqueue(frame, None)
    }

    /// Queue a frame and get a handle that resolves once it is written
    pub(crate) fn send_sync(&self, frame: Frame) -> Result<Arc<IoFuture>, MuxError> {
        let future = Arc::new(IoFuture::new());
        self.enqueue(frame, Some(future.clone()))?;
        Ok(future)
    }

    fn enqueue(&self, frame: Frame, future: Option<Arc<IoFuture>>) -> Result<(), MuxError> {
        let sender = relock(self.outgoing.lock()).clone();
        match sender {
            Some(sender) => sender
                .send(Outgoing { frame, future })
                .map_err(|_| self.down_error()),
            None => Err(self.down_error()),
        }
    }

    fn lookup(&self, id: u32) -> Option<Arc<SessionShared>> {
        self.lock_table().sessions.get(&id).cloned()
    }

    /// Remove `session` from the table if it still holds `id`
    pub(crate) fn retire(&self, id: u32, session: &SessionShared) {
        let mut table = self.lock_table();
        let current = table
            .sessions
            .get(&id)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), session));
        if current {
            table.sessions.remove(&id);
            drop(table);
            self.stats.record_retired();
            debug!(session = id, role = %self.role, "session retired");
        }
    }

    fn open_session(self: &Arc<Self>) -> Result<Session, MuxError> {
        let mut table = self.lock_table();
        if let Some(err) = &table.down {
            return Err(err.clone());
        }
        let max = self.config.max_sessions;
        let id = (0..max)
            .find(|id| !table.sessions.contains_key(id))
            .ok_or(MuxError::TooManySessions(max))?;

        let state = SessionState::new(
            id,
            Role::Client,
            InboundRation::new(self.config.advertised_ration()),
            OutboundRation::from_advertised(self.peer_ration),
        );
        let shared = Arc::new(SessionShared::new(state, self.clone()));
        table.sessions.insert(id, shared.clone());
        drop(table);

        self.stats.record_opened();
        debug!(session = id, "session opened");
        Ok(Session::from_shared(shared))
    }

    /// Create the server side of a session the peer just opened.
    ///
    /// Returns `None` when the session was refused.
    fn register_accepted(self: &Arc<Self>, id: u32) -> Option<Arc<SessionShared>> {
        let mut table = self.lock_table();
        if table.down.is_some() {
            return None;
        }
        if table.sessions.len() >= self.config.max_sessions as usize {
            drop(table);
            warn!(session = id, limit = self.config.max_sessions, "refusing session over limit");
            if let Err(err) = self.send(Frame::Abort {
                session: id,
                message: Some("session limit reached".to_string()),
            }) {
                trace!(session = id, error = %err, "refusal not sent");
            }
            return None;
        }

        let state = SessionState::accepted(
            id,
            InboundRation::new(self.config.advertised_ration()),
            OutboundRation::from_advertised(self.peer_ration),
        );
        let shared = Arc::new(SessionShared::new(state, self.clone()));
        table.sessions.insert(id, shared.clone());
        drop(table);

        self.stats.record_opened();
        debug!(session = id, "session accepted");
        relock(self.accepted.lock()).push_back(Session::from_shared(shared.clone()));
        self.accept_ready.notify_one();
        Some(shared)
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        self.stats.record_frame_received();
        trace!(kind = frame.kind(), session = ?frame.session(), len = frame.payload_len(), "frame received");

        match frame {
            Frame::Hello { .. } => Err(MuxError::Protocol(
                "connection header received twice".to_string(),
            )),
            Frame::Data {
                session,
                flags,
                payload,
            } => self.dispatch_data(session, flags, payload),
            Frame::IncrementRation { session, amount } => match self.lookup(session) {
                Some(shared) => shared.on_increment(amount),
                None => {
                    self.ignore_late(session, "increment");
                    Ok(())
                }
            },
            Frame::Acknowledgment { session } => match self.lookup(session) {
                Some(shared) => shared.on_ack(),
                None => {
                    self.ignore_late(session, "ack");
                    Ok(())
                }
            },
            Frame::Abort { session, message } => {
                match self.lookup(session) {
                    Some(shared) => shared.on_abort(message),
                    None => self.ignore_late(session, "abort"),
                }
                Ok(())
            }
            Frame::Ping { cookie } => {
                if let Err(err) = self.send(Frame::PingAck { cookie }) {
                    trace!(cookie, error = %err, "ping reply not sent");
                }
                Ok(())
            }
            Frame::PingAck { cookie } => {
                let mut pings = relock(self.pings.lock());
                if pings.outstanding.remove(&cookie) {
                    pings.answered.insert(cookie);
                    self.ping_ready.notify_all();
                }
                Ok(())
            }
            Frame::Shutdown { message } => Err(MuxError::PeerShutdown(message)),
            Frame::Error { message } => Err(MuxError::PeerProtocol(message)),
        }
    }

    fn dispatch_data(
        self: &Arc<Self>,
        id: u32,
        flags: DataFlags,
        payload: Bytes,
    ) -> Result<(), MuxError> {
        if let Some(shared) = self.lookup(id) {
            if flags.is_open() && self.role == Role::Server {
                return Err(MuxError::Protocol(format!("session {id} opened twice")));
            }
            return shared.on_data(flags, payload);
        }

        if !flags.is_open() {
            self.ignore_late(id, "data");
            return Ok(());
        }
        if self.role == Role::Client {
            return Err(MuxError::Protocol(format!("server opened session {id}")));
        }
        match self.register_accepted(id) {
            Some(shared) => shared.on_data(flags, payload),
            None => Ok(()),
        }
    }

    /// Frames can still be in flight for a session the other side retired.
    fn ignore_late(&self, id: u32, kind: &'static str) {
        debug!(session = id, kind, "ignoring frame for unknown session");
    }

    /// Fail the connection and every session on it with `err`.
    ///
    /// Only the first call has any effect.
    pub(crate) fn fail(&self, err: MuxError) {
        let sessions: Vec<_> = {
            let mut table = self.lock_table();
            if table.down.is_some() {
                return;
            }
            table.down = Some(err.clone());
            table.sessions.drain().map(|(_, shared)| shared).collect()
        };

        match &err {
            MuxError::Shutdown(_) | MuxError::PeerShutdown(_) => {
                info!(peer = %self.peer, reason = %err, sessions = sessions.len(), "connection shut down");
            }
            _ => {
                warn!(peer = %self.peer, error = %err, sessions = sessions.len(), "connection failed");
            }
        }

        // Dropping the sender lets the writer drain and exit.
        relock(self.outgoing.lock()).take();

        for shared in sessions {
            shared.fail(&err);
        }
        relock(self.accepted.lock()).clear();
        self.accept_ready.notify_all();
        self.ping_ready.notify_all();

        if let Err(close_err) = (self.closer)() {
            debug!(error = %close_err, "closing transport failed");
        }
    }
}

/// Fails the connection if the read loop unwinds.
struct ReadLoopGuard(Arc<MuxCore>);

impl Drop for ReadLoopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0
                .fail(MuxError::Interrupted("read loop panicked".to_string()));
        }
    }
}

fn run_reader<T: Transport>(core: Arc<MuxCore>, mut conn: T, mut parser: FrameParser) {
    let _guard = ReadLoopGuard(core.clone());
    let err = read_frames(&core, &mut conn, &mut parser);

    if matches!(err, MuxError::Protocol(_) | MuxError::Framing(_)) {
        warn!(error = %err, "protocol violation, closing connection");
        if let Ok(future) = core.send_sync(Frame::Error {
            message: err.to_string(),
        }) {
            let _ = future.wait_timeout(ERROR_FRAME_GRACE);
        }
    }
    core.fail(err);
    debug!("read loop stopped");
}

/// Read and dispatch frames until something goes wrong
fn read_frames<T: Transport>(core: &Arc<MuxCore>, conn: &mut T, parser: &mut FrameParser) -> MuxError {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        loop {
            match parser.parse_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = core.dispatch(frame) {
                        return err;
                    }
                }
                Ok(None) => break,
                Err(err) => return err.into(),
            }
        }

        match conn.read(&mut buf) {
            Ok(0) => return MuxError::ConnectionClosed,
            Ok(n) => {
                core.stats.record_bytes_received(n);
                parser.feed(&buf[..n]);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return err.into(),
        }
    }
}

fn run_writer<T: Transport>(core: Arc<MuxCore>, mut conn: T, queue: Receiver<Outgoing>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    for outgoing in queue {
        let frame = &outgoing.frame;
        let future = outgoing.future.as_deref();
        if core.is_down() {
            if let Some(future) = future {
                future.fail(0, core.down_error());
            }
            continue;
        }

        buf.clear();
        frame.encode_into(&mut buf);
        trace!(kind = frame.kind(), session = ?frame.session(), len = frame.payload_len(), "frame sent");

        match write_frame(&mut conn, &buf) {
            Ok(()) => {
                core.stats.record_frame_sent(buf.len());
                if let Some(future) = future {
                    future.complete(frame.payload_len());
                }
            }
            Err((written, err)) => {
                let transmitted = written
                    .saturating_sub(frame.header_len())
                    .min(frame.payload_len());
                let err = MuxError::from(err);
                if let Some(future) = future {
                    future.fail(transmitted, err.clone());
                }
                core.fail(err);
            }
        }
    }
    debug!("writer stopped");
}

/// Write all of `bytes`, reporting how many made it out on failure.
fn write_frame<W: Write>(conn: &mut W, bytes: &[u8]) -> Result<(), (usize, io::Error)> {
    let mut written = 0;
    while written < bytes.len() {
        match conn.write(&bytes[written..]) {
            Ok(0) => {
                return Err((
                    written,
                    io::Error::new(io::ErrorKind::WriteZero, "connection accepted no bytes"),
                ))
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err((written, err)),
        }
    }
    conn.flush().map_err(|err| (written, err))
}

/// Exchange connection headers; returns the peer's advertised ration and
/// a parser holding any bytes read past the header.
fn handshake<T: Transport>(
    conn: &mut T,
    role: Role,
    config: &MuxConfig,
) -> Result<(u32, FrameParser), MuxError> {
    let hello = Frame::Hello {
        version: PROTOCOL_VERSION,
        role,
        initial_ration: config.advertised_ration(),
    };
    conn.write_all(&hello.encode())?;
    conn.flush()?;

    conn.set_read_timeout(Some(config.handshake_timeout_duration()))?;
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 512];
    let peer_ration = loop {
        match parser.parse_frame() {
            Ok(Some(Frame::Hello {
                version,
                role: peer_role,
                initial_ration,
            })) => {
                if version != PROTOCOL_VERSION {
                    return Err(MuxError::Handshake(format!(
                        "unsupported protocol version {version}"
                    )));
                }
                if peer_role != role.peer() {
                    return Err(MuxError::Handshake(format!(
                        "both ends claim the {role} role"
                    )));
                }
                break initial_ration;
            }
            Ok(Some(other)) => {
                return Err(MuxError::Handshake(format!(
                    "expected connection header, got {} frame",
                    other.kind()
                )))
            }
            Ok(None) => {}
            Err(err) => return Err(MuxError::Handshake(err.to_string())),
        }

        match conn.read(&mut buf) {
            Ok(0) => {
                return Err(MuxError::Handshake(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(n) => parser.feed(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(MuxError::Handshake(
                    "timed out waiting for connection header".to_string(),
                ))
            }
            Err(err) => return Err(err.into()),
        }
    };
    conn.set_read_timeout(None)?;
    Ok((peer_ration, parser))
}

/// A multiplexed connection.
///
/// The client side opens sessions with [`open_session`](Self::open_session);
/// the server side receives them from [`accept`](Self::accept). Handles are
/// cheap to clone. The connection stays up until [`shutdown`](Self::shutdown)
/// is called or it fails; dropping every handle does not close it.
#[derive(Clone)]
pub struct Mux {
    core: Arc<MuxCore>,
}

impl Mux {
    /// Start the client side of a connection
    pub fn client<T: Transport>(conn: T, config: MuxConfig) -> Result<Self, MuxError> {
        Self::start(conn, Role::Client, config)
    }

    /// Start the server side of a connection
    pub fn server<T: Transport>(conn: T, config: MuxConfig) -> Result<Self, MuxError> {
        Self::start(conn, Role::Server, config)
    }

    fn start<T: Transport>(mut conn: T, role: Role, config: MuxConfig) -> Result<Self, MuxError> {
        config.validate()?;
        let peer = conn.peer_label();
        let (peer_ration, parser) = handshake(&mut conn, role, &config)?;

        let reader = conn.duplicate()?;
        let closer_handle = Mutex::new(conn.duplicate()?);
        // Unbounded: the read loop enqueues replies and must never block on
        // the writer. Data frames are bounded by ration unless it is unlimited.
        let (sender, queue) = mpsc::channel();

        let core = Arc::new(MuxCore {
            role,
            config,
            peer_ration,
            peer: peer.clone(),
            table: Mutex::new(SessionTable {
                sessions: HashMap::new(),
                down: None,
            }),
            outgoing: Mutex::new(Some(sender)),
            accepted: Mutex::new(VecDeque::new()),
            accept_ready: Condvar::new(),
            pings: Mutex::new(PingState::default()),
            ping_ready: Condvar::new(),
            stats: MuxStats::default(),
            closer: Box::new(move || relock(closer_handle.lock()).close_transport()),
        });

        let writer_core = core.clone();
        let spawned = thread::Builder::new()
            .name(format!("tether-{role}-writer"))
            .spawn(move || run_writer(writer_core, conn, queue))
            .and_then(|_| {
                let reader_core = core.clone();
                thread::Builder::new()
                    .name(format!("tether-{role}-reader"))
                    .spawn(move || run_reader(reader_core, reader, parser))
            });
        if let Err(err) = spawned {
            let err = MuxError::from(err);
            core.fail(err.clone());
            return Err(err);
        }

        info!(role = %role, peer = %peer, peer_ration, "connection established");
        Ok(Self { core })
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.core.config
    }

    /// Open a new session (client side only)
    pub fn open_session(&self) -> Result<Session, MuxError> {
        if self.core.role != Role::Client {
            return Err(MuxError::NotPermitted("only the client side opens sessions"));
        }
        self.core.open_session()
    }

    /// Wait for the peer to open a session (server side only)
    pub fn accept(&self) -> Result<Session, MuxError> {
        loop {
            if let Some(session) = self.accept_timeout(self.core.config.liveness_interval_duration())? {
                return Ok(session);
            }
        }
    }

    /// Like [`accept`](Self::accept) but returns `None` after `timeout`
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<Session>, MuxError> {
        if self.core.role != Role::Server {
            return Err(MuxError::NotPermitted("only the server side accepts sessions"));
        }
        let deadline = Instant::now() + timeout;
        let interval = self.core.config.liveness_interval_duration();
        let mut accepted = relock(self.core.accepted.lock());
        loop {
            if let Some(session) = accepted.pop_front() {
                return Ok(Some(session));
            }
            if self.core.is_down() {
                return Err(self.core.down_error());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            accepted = wait_on(&self.core.accept_ready, accepted, (deadline - now).min(interval));
        }
    }

    /// Round trip a ping through the peer's read loop
    pub fn ping(&self, timeout: Duration) -> Result<Duration, MuxError> {
        let cookie = {
            let mut pings = relock(self.core.pings.lock());
            let cookie = pings.next_cookie;
            pings.next_cookie += 1;
            pings.outstanding.insert(cookie);
            cookie
        };
        let start = Instant::now();
        let interval = self.core.config.liveness_interval_duration();

        let sent = self.core.send(Frame::Ping { cookie });
        let mut pings = relock(self.core.pings.lock());
        if let Err(err) = sent {
            pings.outstanding.remove(&cookie);
            return Err(err);
        }
        loop {
            if pings.answered.remove(&cookie) {
                return Ok(start.elapsed());
            }
            if self.core.is_down() {
                pings.outstanding.remove(&cookie);
                return Err(self.core.down_error());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                pings.outstanding.remove(&cookie);
                return Err(MuxError::Timeout("ping"));
            }
            pings = wait_on(&self.core.ping_ready, pings, (timeout - elapsed).min(interval));
        }
    }

    /// Tell the peer we are going away, then close the connection. Every
    /// session still open fails with [`MuxError::Shutdown`].
    pub fn shutdown(&self, message: &str) {
        if self.core.is_down() {
            return;
        }
        match self.core.send_sync(Frame::Shutdown {
            message: message.to_string(),
        }) {
            Ok(future) => {
                if future
                    .wait_timeout(self.core.config.handshake_timeout_duration())
                    .is_none()
                {
                    debug!("shutdown frame not written in time");
                }
            }
            Err(err) => debug!(error = %err, "shutdown frame not queued"),
        }
        self.core.fail(MuxError::Shutdown(message.to_string()));
    }

    /// Whether the connection has failed or been shut down
    pub fn is_down(&self) -> bool {
        self.core.is_down()
    }

    /// The error that took the connection down, if any
    pub fn down_error(&self) -> Option<MuxError> {
        self.core.lock_table().down.clone()
    }

    /// Number of session ids currently reserved
    pub fn live_sessions(&self) -> usize {
        self.core.lock_table().sessions.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("role", &self.core.role)
            .field("peer", &self.core.peer)
            .finish()
    }
}
