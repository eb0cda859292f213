//! Round-trip probe

use anyhow::{Context, Result};
use clap::Args;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tether_core::MuxConfig;
use tether_mux::Mux;

use super::InvalidInput;

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Address of a tether peer
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    pub connect: String,

    /// Number of pings to send
    #[arg(short = 'n', long, default_value = "4")]
    pub count: u32,

    /// Time to wait for each reply (milliseconds)
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Pause between pings (milliseconds)
    #[arg(long, default_value = "200")]
    pub interval_ms: u64,
}

pub fn run(args: PingArgs, config: MuxConfig) -> Result<()> {
    if args.count == 0 {
        return Err(InvalidInput("--count must be positive".into()).into());
    }
    let stream = TcpStream::connect(&args.connect)
        .with_context(|| format!("connecting to {}", args.connect))?;
    let mux = Mux::client(stream, config)?;

    let result = ping_series(
        &mux,
        args.count,
        Duration::from_millis(args.timeout_ms),
        Duration::from_millis(args.interval_ms),
    );
    mux.shutdown("ping finished");
    let rtts = result?;

    for (seq, rtt) in rtts.iter().enumerate() {
        println!("reply from {}: seq={} time={:.3} ms", args.connect, seq, millis(*rtt));
    }
    if let Some(summary) = Summary::of(&rtts) {
        println!(
            "{} pings, min/avg/max = {:.3}/{:.3}/{:.3} ms",
            rtts.len(),
            millis(summary.min),
            millis(summary.avg),
            millis(summary.max)
        );
    }
    Ok(())
}

/// Send `count` pings, `interval` apart
pub fn ping_series(
    mux: &Mux,
    count: u32,
    timeout: Duration,
    interval: Duration,
) -> Result<Vec<Duration>> {
    let mut rtts = Vec::with_capacity(count as usize);
    for seq in 0..count {
        if seq > 0 {
            thread::sleep(interval);
        }
        let rtt = mux
            .ping(timeout)
            .with_context(|| format!("ping {seq}"))?;
        rtts.push(rtt);
    }
    Ok(rtts)
}

struct Summary {
    min: Duration,
    avg: Duration,
    max: Duration,
}

impl Summary {
    fn of(rtts: &[Duration]) -> Option<Self> {
        let min = rtts.iter().min()?;
        let max = rtts.iter().max()?;
        let total: Duration = rtts.iter().sum();
        Some(Self {
            min: *min,
            avg: total / rtts.len() as u32,
            max: *max,
        })
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
