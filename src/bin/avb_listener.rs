//! AVTP Listener
//!
//! Captures one IEEE 1722 stream from a raw Ethernet interface and writes its
//! payload either to a file (`file*` modes) or to stdout for piping into a
//! decoder.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avb_streamer::{
    config::{AppConfig, ListenerMode},
    shutdown::ShutdownSignal,
    stream::{ingest::file_sink_for, IngestOptions, StreamIngest, WriterSink},
};

#[derive(Parser, Debug)]
#[command(name = "avb-listener", version, about = "Receive an IEEE 1722 stream")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface to capture on
    #[arg(short, long)]
    interface: Option<String>,

    /// Hex stream id to accept, 0 for any
    #[arg(short, long)]
    stream_id: Option<String>,

    /// mpegts|cvf|audio|audio8|aaf, or a file variant (filempegts, ...)
    #[arg(short, long)]
    mode: Option<ListenerMode>,

    /// Output file for the file modes
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Receive timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    // stdout may carry the payload; logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let shutdown = ShutdownSignal::install().context("Failed to install signal handler")?;

    let mut config =
        AppConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    let listener = &mut config.listener;
    if let Some(interface) = args.interface {
        listener.interface = interface;
    }
    if let Some(stream_id) = args.stream_id {
        listener.stream_id = stream_id;
    }
    if let Some(mode) = args.mode {
        listener.mode = mode;
    }
    if let Some(output) = args.output {
        listener.output = Some(output);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        listener.recv_timeout_ms = timeout_ms;
    }
    config.validate().context("Invalid configuration")?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let listener = config.listener.clone();
    tracing::info!(
        "Starting AVTP listener on {} in {} mode",
        listener.interface,
        listener.mode
    );

    let options = IngestOptions::from_config(&listener)?;
    let mut ingest = StreamIngest::new(options);
    let timeout = listener.recv_timeout();

    if listener.mode.is_file() {
        let (sink, path) = file_sink_for(&listener)
            .with_context(|| format!("Failed to create output for {}", listener.mode))?;
        tracing::info!("Writing payload to {}", path.display());
        ingest
            .start_on_interface(&listener.interface, timeout, sink)
            .with_context(|| format!("Failed to start capture on {}", listener.interface))?;
    } else {
        let sink = WriterSink::new(BufWriter::new(io::stdout()));
        ingest
            .start_on_interface(&listener.interface, timeout, sink)
            .with_context(|| format!("Failed to start capture on {}", listener.interface))?;
    }

    shutdown.wait_until(Duration::from_millis(200), || ingest.is_finished());

    let stats = ingest.stop();
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
