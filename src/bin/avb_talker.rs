//! AVTP Talker
//!
//! Streams an MPEG-TS file as IEEE 1722 61883-4 frames on a raw Ethernet
//! interface.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::Parser;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avb_streamer::{
    avtp::TS_PACKET_SIZE,
    config::AppConfig,
    network::RawChannel,
    shutdown::ShutdownSignal,
    stream::{EgressOptions, EgressWorker, StreamEgress},
};

/// TS packets read from the file per queued buffer
const TS_PACKETS_PER_READ: usize = 7 * 64;

#[derive(Parser, Debug)]
#[command(name = "avb-talker", version, about = "Stream an MPEG-TS file over IEEE 1722")]
struct Args {
    /// MPEG-TS input file
    input: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface to transmit on
    #[arg(short, long)]
    interface: Option<String>,

    /// Stream index (low 16 bits of the stream id)
    #[arg(short, long)]
    stream_index: Option<u16>,

    /// Destination MAC address
    #[arg(short, long)]
    destination: Option<String>,

    #[arg(long)]
    vlan_id: Option<u16>,

    #[arg(long)]
    vlan_priority: Option<u8>,

    /// TS packets per AVTP frame (1..=7)
    #[arg(long)]
    ts_per_frame: Option<usize>,

    /// Sleep between frames in microseconds
    #[arg(long)]
    pacing_us: Option<u64>,

    /// Start over at end of file
    #[arg(long = "loop")]
    repeat: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let shutdown = ShutdownSignal::install().context("Failed to install signal handler")?;

    let mut config =
        AppConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    let talker = &mut config.talker;
    if let Some(interface) = args.interface {
        talker.interface = interface;
    }
    if let Some(index) = args.stream_index {
        talker.stream_index = index;
    }
    if let Some(destination) = args.destination {
        talker.destination = destination;
    }
    if let Some(vid) = args.vlan_id {
        talker.vlan_id = vid;
    }
    if let Some(priority) = args.vlan_priority {
        talker.vlan_priority = priority;
    }
    if let Some(units) = args.ts_per_frame {
        talker.ts_per_frame = units;
    }
    if let Some(pacing) = args.pacing_us {
        talker.pacing_us = pacing;
    }
    config.validate().context("Invalid configuration")?;
    let talker = config.talker.clone();

    let mut input = File::open(&args.input)
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let file_len = input.metadata()?.len();
    if file_len < TS_PACKET_SIZE as u64 {
        bail!("{} holds no complete TS packet", args.input.display());
    }

    let channel = RawChannel::open(&talker.interface)
        .with_context(|| format!("Failed to open raw socket on {}", talker.interface))?;
    let options = EgressOptions::from_config(&talker)?;
    let worker = EgressWorker::spawn(StreamEgress::new(channel, options), 4)?;

    tracing::info!(
        "Streaming {} ({} bytes) on {}",
        args.input.display(),
        file_len,
        talker.interface
    );

    let chunk_len = TS_PACKETS_PER_READ * TS_PACKET_SIZE;
    let mut buffer = BytesMut::with_capacity(chunk_len);
    'outer: loop {
        loop {
            if shutdown.is_requested() {
                break 'outer;
            }
            buffer.resize(chunk_len, 0);
            let read = read_full(&mut input, &mut buffer)?;
            // Whole TS packets only
            buffer.truncate(read - read % TS_PACKET_SIZE);
            if buffer.is_empty() {
                break;
            }
            if worker.submit(buffer.split().freeze()).is_err() {
                tracing::error!("Talker thread exited early");
                break 'outer;
            }
            if read < chunk_len {
                break;
            }
        }
        if !args.repeat {
            break;
        }
        input = File::open(&args.input)?;
    }

    let stats = if shutdown.is_requested() {
        let mut worker = worker;
        worker.stop()
    } else {
        worker.finish()
    };
    if let Some(stats) = stats {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

/// Fill `buf` unless end of file comes first; returns the bytes read
fn read_full(input: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
