//! CLI tool for the tether session multiplexer.
//!
//! Provides commands for:
//! - serve: Echo server
//! - bench: Concurrent echo load generator
//! - ping: Connection round-trip probe

mod commands;

use clap::{Parser, Subcommand};
use commands::{bench, ping, serve, InvalidInput};
use std::path::PathBuf;
use tether_core::MuxError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "CLI tool for the tether session multiplexer", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON file with mux settings (ration, fragment size, session limit)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every session back to its client
    Serve(serve::ServeArgs),
    /// Echo data over concurrent sessions and report throughput
    Bench(bench::BenchArgs),
    /// Measure connection round-trip time
    Ping(ping::PingArgs),
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<InvalidInput>().is_some() {
        return 2;
    }
    match err.downcast_ref::<MuxError>() {
        Some(MuxError::InvalidConfig(_)) => 2,
        Some(mux) if mux.is_connection_level() => 3,
        Some(_) => 4,
        None if err.downcast_ref::<std::io::Error>().is_some() => 3,
        None => 1,
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing("tether=info", cli.log_json);

    let result = commands::load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Serve(args) => serve::run(args, config),
        Commands::Bench(args) => bench::run(args, config),
        Commands::Ping(args) => ping::run(args, config),
    });

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "tether",
            "bench",
            "--sessions",
            "4",
            "--config",
            "mux.json",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("mux.json")));
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::Bench(ref args) if args.sessions == 4));
    }

    #[test]
    fn test_exit_codes() {
        let invalid = anyhow::Error::new(InvalidInput("--sessions must be positive".into()));
        assert_eq!(exit_code(&invalid), 2);

        let config = anyhow::Error::new(MuxError::InvalidConfig("bad".into()));
        assert_eq!(exit_code(&config), 2);

        let closed = anyhow::Error::new(MuxError::ConnectionClosed).context("pinging");
        assert_eq!(exit_code(&closed), 3);

        let peer = anyhow::Error::new(MuxError::PeerError("no".into()));
        assert_eq!(exit_code(&peer), 4);

        assert_eq!(exit_code(&anyhow::anyhow!("echo mismatch")), 1);
    }
}
