//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tether_mux::{Mux, MuxConfig, MuxError, Session};

// Short liveness period so blocked waits re-check promptly
pub fn config() -> MuxConfig {
    MuxConfig::new().liveness_interval(Duration::from_millis(50))
}

/// Connect a client and a server mux over loopback TCP
pub fn pair_with(client: MuxConfig, server: MuxConfig) -> (Mux, Mux) {
    let (client_stream, server_stream) = tcp_pair();
    let handle = thread::spawn(move || Mux::server(server_stream, server).unwrap());
    let client = Mux::client(client_stream, client).unwrap();
    (client, handle.join().unwrap())
}

pub fn pair() -> (Mux, Mux) {
    pair_with(config(), config())
}

pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Echo every accepted session back to the client until the mux goes down
pub fn spawn_echo(server: Mux) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(session) = server.accept() {
            thread::spawn(move || echo(session));
        }
    })
}

pub fn echo(session: Session) -> Result<u64, MuxError> {
    let copied = io::copy(&mut session.input(), &mut session.output())?;
    session.close()?;
    Ok(copied)
}

/// Send `data` on a new session and collect everything the peer sends back
pub fn round_trip(client: &Mux, data: Vec<u8>) -> Result<(Session, Vec<u8>), MuxError> {
    let session = client.open_session()?;
    let writer = {
        let session = session.clone();
        thread::spawn(move || -> Result<(), MuxError> {
            let mut output = session.output();
            output.write_all(&data)?;
            output.close()
        })
    };

    let mut received = Vec::new();
    let read = session.input().read_to_end(&mut received);
    let written = writer
        .join()
        .map_err(|_| MuxError::Interrupted("writer panicked".to_string()))?;
    read?;
    written?;
    session.close()?;
    Ok((session, received))
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// The mux error carried by an I/O error from a session stream
pub fn mux_error(err: &io::Error) -> Option<&MuxError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<MuxError>())
}
