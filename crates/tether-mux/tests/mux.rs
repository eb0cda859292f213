//! End-to-end tests for the session multiplexer
//!
//! Every test runs a client and a server mux over a loopback connection.

mod common;

use common::*;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tether_mux::{Mux, MuxError, SessionOutcome};

#[test]
fn test_echo_preserves_order() {
    let (client, server) = pair();
    spawn_echo(server);

    let data = pattern(300_000, 1);
    let (session, received) = round_trip(&client, data.clone()).unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);
    assert!(matches!(session.outcome(), SessionOutcome::Completed));
    assert!(session.is_retired());
}

#[test]
fn test_concurrent_sessions_do_not_mix() {
    let (client, server) = pair();
    spawn_echo(server);

    let handles: Vec<_> = (0..8u8)
        .map(|seed| {
            let client = client.clone();
            thread::spawn(move || {
                let data = pattern(128 * 1024 + seed as usize, seed);
                let (_, received) = round_trip(&client, data.clone()).unwrap();
                received == data
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    wait_until("client sessions released", || client.live_sessions() == 0);
}

#[test]
fn test_small_fragments_and_unlimited_ration() {
    let unlimited = config().initial_ration(None).max_fragment_size(1000);
    let (client, server) = pair_with(unlimited.clone(), unlimited);
    spawn_echo(server);

    let data = pattern(50_000, 4);
    let (_, received) = round_trip(&client, data.clone()).unwrap();
    assert!(received == data);
    assert_eq!(client.stats().ration_increments_sent, 0);
}

#[test]
fn test_ration_blocks_writer_until_reader_drains_half() {
    let (client, server) = pair_with(config(), config().initial_ration(Some(512)));
    let session = client.open_session().unwrap();
    let data = pattern(1000, 7);

    let writer = {
        let session = session.clone();
        let data = data.clone();
        thread::spawn(move || -> Result<(), MuxError> {
            let mut output = session.output();
            output.write_all(&data)?;
            output.flush()?;
            output.close()
        })
    };

    let accepted = server.accept().unwrap();
    let mut input = accepted.input();
    wait_until("first 512 bytes", || input.available() == 512);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(input.available(), 512);
    assert!(!writer.is_finished());
    assert_eq!(server.stats().ration_increments_sent, 0);

    let mut received = vec![0u8; 256];
    input.read_exact(&mut received).unwrap();
    assert_eq!(server.stats().ration_increments_sent, 1);
    wait_until("another 256 bytes", || input.available() == 512);

    input.read_to_end(&mut received).unwrap();
    writer.join().unwrap().unwrap();
    assert!(received == data);

    accepted.close().unwrap();
    let mut reply = Vec::new();
    session.input().read_to_end(&mut reply).unwrap();
    session.close().unwrap();
    assert!(reply.is_empty());
    assert!(!server.is_down());
}

#[test]
fn test_increments_are_batched() {
    let (client, server) = pair_with(config(), config().initial_ration(Some(512)));
    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(&pattern(512, 2)).unwrap();
    output.flush().unwrap();

    let accepted = server.accept().unwrap();
    let mut input = accepted.input();
    wait_until("full ration buffered", || input.available() == 512);

    let mut byte = [0u8; 1];
    let mut read_bytes = |count: usize| {
        for _ in 0..count {
            input.read_exact(&mut byte).unwrap();
        }
    };

    read_bytes(255);
    assert_eq!(server.stats().ration_increments_sent, 0);
    read_bytes(1);
    assert_eq!(server.stats().ration_increments_sent, 1);
    read_bytes(255);
    assert_eq!(server.stats().ration_increments_sent, 1);
    read_bytes(1);
    assert_eq!(server.stats().ration_increments_sent, 2);
}

#[test]
fn test_abort_is_isolated_to_one_session() {
    let (client, server) = pair();
    spawn_echo(server);

    let aborted = client.open_session().unwrap();
    let mut output = aborted.output();
    output.write_all(b"partial request").unwrap();
    output.flush().unwrap();

    let other = {
        let client = client.clone();
        thread::spawn(move || round_trip(&client, pattern(100_000, 3)))
    };
    aborted.abort(None);

    let (session, received) = other.join().unwrap().unwrap();
    assert!(received == pattern(100_000, 3));
    assert!(matches!(session.outcome(), SessionOutcome::Completed));
    assert!(matches!(
        aborted.outcome(),
        SessionOutcome::Aborted { by_peer: false }
    ));

    let err = output.write(b"more").unwrap_err();
    assert!(matches!(
        mux_error(&err),
        Some(MuxError::SessionAborted { by_peer: false })
    ));
    wait_until("abort answered", || aborted.is_retired());
    wait_until("client sessions released", || client.live_sessions() == 0);
    assert!(!client.is_down());
}

#[test]
fn test_connection_failure_reaches_every_session() {
    let (client_stream, server_stream) = tcp_pair();
    let severed = server_stream.try_clone().unwrap();
    let server = thread::spawn(move || Mux::server(server_stream, config()).unwrap());
    let client = Mux::client(client_stream, config()).unwrap();
    let server = server.join().unwrap();

    let sessions = [client.open_session().unwrap(), client.open_session().unwrap()];
    for session in &sessions {
        let mut output = session.output();
        output.write_all(b"in flight").unwrap();
        output.flush().unwrap();
    }
    let accepted = [server.accept().unwrap(), server.accept().unwrap()];

    let readers: Vec<_> = sessions
        .iter()
        .cloned()
        .map(|session| {
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                session.input().read(&mut buf)
            })
        })
        .collect();

    severed.shutdown(Shutdown::Both).unwrap();

    let errors: Vec<String> = readers
        .into_iter()
        .map(|reader| {
            let err = reader.join().unwrap().unwrap_err();
            mux_error(&err).unwrap().to_string()
        })
        .collect();
    assert_eq!(errors[0], errors[1]);
    assert!(client.is_down());
    assert_eq!(client.live_sessions(), 0);
    for session in &sessions {
        assert!(matches!(session.outcome(), SessionOutcome::Failed(_)));
    }

    wait_until("server down", || server.is_down());
    for session in &accepted {
        assert!(matches!(session.outcome(), SessionOutcome::Failed(_)));
    }
    assert!(client.open_session().is_err());
}

#[test]
fn test_acknowledgment_holds_server_entry() {
    let (client, server) = pair();
    let (closed_tx, closed_rx) = mpsc::channel();
    let handler = {
        let server = server.clone();
        thread::spawn(move || {
            let session = server.accept().unwrap();
            session.require_acknowledgment().unwrap();
            let mut request = Vec::new();
            session.input().read_to_end(&mut request).unwrap();
            session.output().write_all(&request).unwrap();
            session.close().unwrap();
            closed_tx.send(()).unwrap();
            session
        })
    };

    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(b"ack me").unwrap();
    output.close().unwrap();
    closed_rx.recv().unwrap();

    let mut reply = [0u8; 6];
    session.input().read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ack me");

    thread::sleep(Duration::from_millis(100));
    let server_session = handler.join().unwrap();
    assert_eq!(server.live_sessions(), 1);
    assert!(!server_session.acknowledged());
    assert!(!session.is_retired());

    // Reading the end of stream sends the acknowledgment.
    assert_eq!(session.input().read(&mut reply).unwrap(), 0);
    assert!(session.is_retired());
    wait_until("server entry removed", || server.live_sessions() == 0);
    assert!(server_session.acknowledged());
    assert!(matches!(server_session.outcome(), SessionOutcome::Completed));
}

#[test]
fn test_server_abort_after_close_keeps_id_until_acknowledged() {
    let (client, server) = pair();
    let (closed_tx, closed_rx) = mpsc::channel();
    let handler = {
        let server = server.clone();
        thread::spawn(move || {
            let session = server.accept().unwrap();
            session.require_acknowledgment().unwrap();
            let mut request = Vec::new();
            session.input().read_to_end(&mut request).unwrap();
            session.output().write_all(&request).unwrap();
            session.close().unwrap();
            session.abort(Some("too late"));
            closed_tx.send(()).unwrap();
            session
        })
    };

    let first = client.open_session().unwrap();
    let mut output = first.output();
    output.write_all(b"first").unwrap();
    output.close().unwrap();
    closed_rx.recv().unwrap();

    let mut reply = Vec::new();
    first.input().read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"first");
    assert!(first.is_retired());
    assert!(matches!(first.outcome(), SessionOutcome::Completed));

    let server_session = handler.join().unwrap();
    wait_until("server entry removed", || server.live_sessions() == 0);
    assert!(server_session.acknowledged());
    assert!(matches!(
        server_session.outcome(),
        SessionOutcome::Aborted { by_peer: false }
    ));

    // The released id goes straight to a new session, which must not see
    // anything addressed to the old one.
    spawn_echo(server);
    for round in 0..3u8 {
        let (session, reply) = round_trip(&client, vec![round; 64]).unwrap();
        assert_eq!(session.id(), first.id());
        assert_eq!(reply, vec![round; 64]);
        assert!(matches!(session.outcome(), SessionOutcome::Completed));
    }
    assert!(!client.is_down());
}

#[test]
fn test_client_abort_after_close_acknowledges() {
    let (client, server) = pair();
    let handler = {
        let server = server.clone();
        thread::spawn(move || {
            let session = server.accept().unwrap();
            session.require_acknowledgment().unwrap();
            let mut output = session.output();
            output.write_all(b"unread reply").unwrap();
            session.close().unwrap();
            session
        })
    };

    let session = client.open_session().unwrap();
    session.output().close().unwrap();
    wait_until("close received", || {
        matches!(session.outcome(), SessionOutcome::Completed)
    });

    session.abort(Some("not interested"));
    assert!(session.is_retired());

    let server_session = handler.join().unwrap();
    wait_until("server entry removed", || server.live_sessions() == 0);
    assert!(server_session.acknowledged());
    assert!(matches!(server_session.outcome(), SessionOutcome::Completed));
    assert!(!server.is_down());
}

#[test]
fn test_close_without_acknowledgment_retires_immediately() {
    let (client, server) = pair();
    let handler = thread::spawn(move || {
        let session = server.accept().unwrap();
        let echoed = echo(session).unwrap();
        (echoed, server.live_sessions())
    });

    let (session, reply) = round_trip(&client, b"bye".to_vec()).unwrap();
    let (echoed, live) = handler.join().unwrap();
    assert_eq!(echoed, 3);
    assert_eq!(live, 0);
    assert_eq!(reply, b"bye");
    assert!(session.is_retired());
    assert_eq!(client.live_sessions(), 0);
}

#[test]
fn test_early_input_close_acknowledges() {
    let (client, server) = pair();
    let handler = thread::spawn(move || {
        let session = server.accept().unwrap();
        session.output().write_all(&pattern(200_000, 5)).unwrap();
        session.close()
    });

    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(b"stream please").unwrap();
    output.close().unwrap();

    let mut head = [0u8; 100];
    session.input().read_exact(&mut head).unwrap();
    session.input().close();

    let err = session.input().read(&mut head).unwrap_err();
    assert!(matches!(mux_error(&err), Some(MuxError::StreamClosed)));

    // Discarded input still returns ration, so the server finishes.
    handler.join().unwrap().unwrap();
    wait_until("client session retired", || session.is_retired());
    assert!(!client.is_down());
}

#[test]
fn test_writes_after_peer_close_are_discarded() {
    let (client, server) = pair();
    let handler = thread::spawn(move || {
        let session = server.accept().unwrap();
        let mut greeting = [0u8; 5];
        session.input().read_exact(&mut greeting).unwrap();
        session.close().unwrap();
        greeting
    });

    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(b"hello").unwrap();
    output.flush().unwrap();
    assert_eq!(&handler.join().unwrap(), b"hello");

    let mut reply = Vec::new();
    session.input().read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());

    output.write_all(&pattern(64 * 1024, 9)).unwrap();
    output.close().unwrap();
    assert!(session.is_retired());
    assert!(matches!(session.outcome(), SessionOutcome::Completed));
}

#[test]
fn test_peer_error_message() {
    let (client, server) = pair();
    let handler = thread::spawn(move || {
        let session = server.accept().unwrap();
        let mut request = Vec::new();
        session.input().read_to_end(&mut request).unwrap();
        session.abort(Some("bad request"));
        session
    });

    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(b"nonsense").unwrap();
    output.close().unwrap();

    let err = session.input().read_to_end(&mut Vec::new()).unwrap_err();
    assert!(matches!(mux_error(&err), Some(MuxError::PeerError(m)) if m == "bad request"));
    assert!(matches!(session.outcome(), SessionOutcome::PeerError(m) if m == "bad request"));
    assert!(session.is_retired());

    let server_session = handler.join().unwrap();
    assert!(matches!(
        server_session.outcome(),
        SessionOutcome::Aborted { by_peer: false }
    ));
}

#[test]
fn test_server_refuses_sessions_over_limit() {
    let (client, server) = pair_with(config(), config().max_sessions(1));

    let first = client.open_session().unwrap();
    first.output().write_all(b"one").unwrap();
    first.output().flush().unwrap();
    let accepted = server.accept().unwrap();

    let second = client.open_session().unwrap();
    second.output().write_all(b"two").unwrap();
    second.output().flush().unwrap();

    let err = second.input().read(&mut [0u8; 4]).unwrap_err();
    assert!(matches!(mux_error(&err), Some(MuxError::PeerError(m)) if m == "session limit reached"));
    assert!(second.is_retired());
    assert!(server
        .accept_timeout(Duration::from_millis(100))
        .unwrap()
        .is_none());

    accepted.output().write_all(b"ok").unwrap();
    accepted.output().flush().unwrap();
    let mut reply = [0u8; 2];
    first.input().read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");
}

#[test]
fn test_session_ids_are_reused_after_release() {
    let (client, _server) = pair_with(config().max_sessions(2), config());

    let a = client.open_session().unwrap();
    let b = client.open_session().unwrap();
    assert_eq!((a.id(), b.id()), (0, 1));
    assert!(matches!(
        client.open_session(),
        Err(MuxError::TooManySessions(2))
    ));

    // Nothing was sent on `a`, so aborting releases its id at once.
    a.abort(None);
    assert!(a.is_retired());
    assert_eq!(client.open_session().unwrap().id(), 0);
}

#[test]
fn test_roles_are_enforced() {
    let (client, server) = pair();
    assert!(matches!(
        server.open_session(),
        Err(MuxError::NotPermitted(_))
    ));
    assert!(matches!(
        client.accept_timeout(Duration::from_millis(10)),
        Err(MuxError::NotPermitted(_))
    ));

    let session = client.open_session().unwrap();
    assert!(matches!(
        session.require_acknowledgment(),
        Err(MuxError::NotPermitted(_))
    ));
}

#[test]
fn test_ping_round_trip() {
    let (client, server) = pair();
    let rtt = client.ping(Duration::from_secs(5)).unwrap();
    assert!(rtt < Duration::from_secs(5));
    server.ping(Duration::from_secs(5)).unwrap();
    assert!(client.stats().frames_received >= 1);
}

#[test]
fn test_shutdown_notifies_peer() {
    let (client, server) = pair();
    let session = client.open_session().unwrap();
    let mut output = session.output();
    output.write_all(b"hello").unwrap();
    output.flush().unwrap();
    let accepted = server.accept().unwrap();

    server.shutdown("maintenance");
    assert!(matches!(server.down_error(), Some(MuxError::Shutdown(_))));
    assert!(matches!(
        accepted.outcome(),
        SessionOutcome::Failed(MuxError::Shutdown(_))
    ));

    let err = session.input().read(&mut [0u8; 8]).unwrap_err();
    assert!(matches!(mux_error(&err), Some(MuxError::PeerShutdown(m)) if m == "maintenance"));
    assert!(client.is_down());
    assert!(client.open_session().is_err());
    assert!(server.accept().is_err());
}

#[test]
fn test_stats_track_session_lifecycle() {
    let (client, server) = pair();
    spawn_echo(server);
    round_trip(&client, pattern(10_000, 6)).unwrap();

    let stats = client.stats();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.sessions_retired, 1);
    assert!(stats.frames_sent >= 2);
    assert!(stats.bytes_sent >= 10_000);
    assert!(stats.bytes_received >= 10_000);

    let json = serde_json::to_value(stats).unwrap();
    assert_eq!(json["sessions_opened"], 1);
}

#[cfg(unix)]
#[test]
fn test_echo_over_unix_socket() {
    let (client_stream, server_stream) = std::os::unix::net::UnixStream::pair().unwrap();
    let server = thread::spawn(move || Mux::server(server_stream, config()).unwrap());
    let client = Mux::client(client_stream, config()).unwrap();
    spawn_echo(server.join().unwrap());

    let (_, received) = round_trip(&client, b"over a unix socket".to_vec()).unwrap();
    assert_eq!(received, b"over a unix socket");
}
