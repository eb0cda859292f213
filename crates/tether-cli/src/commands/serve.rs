//! Echo server command

use anyhow::{Context, Result};
use clap::Args;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::thread;
use tether_core::{MuxConfig, MuxError};
use tether_mux::{Mux, Session};
use tracing::{debug, info, warn};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    pub listen: String,

    /// Exit after serving this many connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}

pub fn run(args: ServeArgs, config: MuxConfig) -> Result<()> {
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %listener.local_addr()?, "echo server listening");
    serve(listener, config, args.max_connections)
}

/// Accept connections until `limit` have been served (or forever)
pub fn serve(listener: TcpListener, config: MuxConfig, limit: Option<usize>) -> Result<()> {
    let mut handles = Vec::new();
    for (served, stream) in listener.incoming().enumerate() {
        let stream = stream.context("accepting connection")?;
        let config = config.clone();
        let handle = thread::Builder::new()
            .name("tether-serve".to_string())
            .spawn(move || serve_connection(stream, config))?;

        // Unbounded servers detach their connections.
        if limit.is_some() {
            handles.push(handle);
        }
        if limit.is_some_and(|limit| served + 1 >= limit) {
            break;
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            warn!("connection thread panicked");
        }
    }
    Ok(())
}

fn serve_connection(stream: TcpStream, config: MuxConfig) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mux = match Mux::server(stream, config) {
        Ok(mux) => mux,
        Err(err) => {
            warn!(%peer, error = %err, "handshake failed");
            return;
        }
    };

    let mut sessions = 0u64;
    loop {
        match mux.accept() {
            Ok(session) => {
                sessions += 1;
                thread::spawn(move || {
                    let id = session.id();
                    match echo_session(session) {
                        Ok(bytes) => debug!(session = id, bytes, "session echoed"),
                        Err(err) => debug!(session = id, error = %err, "session ended early"),
                    }
                });
            }
            Err(err) => {
                info!(%peer, sessions, reason = %err, "connection finished");
                return;
            }
        }
    }
}

/// Copy everything the client sends back to it, then close the session
pub fn echo_session(session: Session) -> Result<u64, MuxError> {
    let copied = io::copy(&mut session.input(), &mut session.output())?;
    session.close()?;
    Ok(copied)
}
