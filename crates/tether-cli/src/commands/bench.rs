//! Benchmarking command

use anyhow::{anyhow, ensure, Context, Result};
use clap::Args;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tether_core::{MuxConfig, MuxError};
use tether_mux::{Mux, StatsSnapshot};

use super::InvalidInput;

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Address of a `tether serve` instance
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    pub connect: String,

    /// Number of concurrent sessions
    #[arg(short, long, default_value = "8")]
    pub sessions: usize,

    /// Bytes echoed by each session
    #[arg(short, long, default_value = "1048576")]
    pub bytes: usize,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub output: String,
}

/// Result of one benchmark run
#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub sessions: usize,
    pub bytes_per_session: usize,
    pub elapsed_ms: f64,
    /// Echoed payload per second, counting each byte once
    pub mib_per_sec: f64,
    pub session_p50_ms: f64,
    pub session_p99_ms: f64,
    pub stats: StatsSnapshot,
}

pub fn run(args: BenchArgs, config: MuxConfig) -> Result<()> {
    if args.sessions == 0 {
        return Err(InvalidInput("--sessions must be positive".into()).into());
    }
    if !matches!(args.output.as_str(), "text" | "json") {
        return Err(InvalidInput(format!("unknown output format {:?}", args.output)).into());
    }

    let stream = TcpStream::connect(&args.connect)
        .with_context(|| format!("connecting to {}", args.connect))?;
    let mux = Mux::client(stream, config)?;
    let report = run_bench(&mux, args.sessions, args.bytes);
    mux.shutdown("bench finished");
    let report = report?;

    if args.output == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Sessions:     {}", report.sessions);
        println!("Per session:  {} bytes", report.bytes_per_session);
        println!("Elapsed:      {:.1} ms", report.elapsed_ms);
        println!("Throughput:   {:.2} MiB/s", report.mib_per_sec);
        println!(
            "Session time: p50 {:.2} ms, p99 {:.2} ms",
            report.session_p50_ms, report.session_p99_ms
        );
        println!(
            "Frames:       {} sent, {} received, {} ration increments",
            report.stats.frames_sent, report.stats.frames_received, report.stats.ration_increments_sent
        );
    }
    Ok(())
}

/// Echo `bytes` on each of `sessions` concurrent sessions and verify the replies
pub fn run_bench(mux: &Mux, sessions: usize, bytes: usize) -> Result<BenchReport> {
    let start = Instant::now();
    let handles: Vec<_> = (0..sessions)
        .map(|i| {
            let mux = mux.clone();
            thread::spawn(move || echo_transfer(&mux, i as u8, bytes))
        })
        .collect();

    let mut histogram = Histogram::<u64>::new(3)?;
    for (i, handle) in handles.into_iter().enumerate() {
        let took = handle
            .join()
            .map_err(|_| anyhow!("session {i} panicked"))?
            .with_context(|| format!("session {i}"))?;
        histogram.record(u64::try_from(took.as_micros()).unwrap_or(u64::MAX))?;
    }
    let elapsed = start.elapsed();

    let total = (sessions * bytes) as f64;
    Ok(BenchReport {
        sessions,
        bytes_per_session: bytes,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        mib_per_sec: total / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON),
        session_p50_ms: histogram.value_at_quantile(0.5) as f64 / 1000.0,
        session_p99_ms: histogram.value_at_quantile(0.99) as f64 / 1000.0,
        stats: mux.stats(),
    })
}

fn echo_transfer(mux: &Mux, seed: u8, len: usize) -> Result<Duration> {
    let start = Instant::now();
    let payload: Vec<u8> = (0..len).map(|i| (i as u8) ^ seed).collect();
    let session = mux.open_session()?;

    let writer = {
        let session = session.clone();
        let payload = payload.clone();
        thread::spawn(move || -> Result<(), MuxError> {
            let mut output = session.output();
            output.write_all(&payload)?;
            output.close()
        })
    };

    let mut received = Vec::with_capacity(len);
    let read = session.input().read_to_end(&mut received);
    writer.join().map_err(|_| anyhow!("writer panicked"))??;
    read?;
    session.close()?;

    ensure!(
        received == payload,
        "echoed {} bytes do not match the {} sent",
        received.len(),
        payload.len()
    );
    Ok(start.elapsed())
}
