//! CRF Listener
//!
//! Recovers the talker's media clock from a CRF stream and, depending on the
//! mode, steers the ASRC ratio to follow it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avb_streamer::{
    clock::{ApeDriver, ClockHardware, ClockRecovery, ControlSurface, NullHardware, RecoveryOptions},
    config::{AppConfig, ClockConfig, ClockMode},
    network::RawChannel,
    shutdown::ShutdownSignal,
};

#[derive(Parser, Debug)]
#[command(name = "crf-listener", version, about = "Recover a media clock from CRF")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface carrying the CRF stream
    #[arg(short, long)]
    interface: Option<String>,

    /// Measurement window in milliseconds
    #[arg(short = 't', long)]
    interval_ms: Option<u64>,

    /// ASRC stream whose ratio is programmed (1..=6)
    #[arg(short = 's', long)]
    asrc_stream: Option<u8>,

    /// ARAD lane read in i2s_slave mode (1..=6)
    #[arg(short = 'l', long)]
    arad_lane: Option<u8>,

    /// estimate|asrc|i2s_master|i2s_slave
    #[arg(short, long)]
    mode: Option<ClockMode>,

    /// Seconds to wait for the ASRC after opening the driver
    #[arg(long)]
    settle_secs: Option<u64>,

    /// Run without the clock driver (estimate mode only)
    #[arg(long)]
    no_driver: bool,
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
    let clock = &mut config.clock;
    if let Some(interface) = args.interface {
        clock.interface = interface;
    }
    if let Some(interval) = args.interval_ms {
        clock.interval_ms = interval;
    }
    if let Some(stream) = args.asrc_stream {
        clock.asrc_stream = stream;
    }
    if let Some(lane) = args.arad_lane {
        clock.arad_lane = lane;
    }
    if let Some(mode) = args.mode {
        clock.mode = mode;
    }
    if let Some(settle) = args.settle_secs {
        clock.settle_secs = settle;
    }
    config.validate().context("Invalid configuration")?;
    let clock = config.clock.clone();

    if args.no_driver {
        anyhow::ensure!(
            clock.mode == ClockMode::Estimate,
            "--no-driver only works in estimate mode"
        );
        let hardware = NullHardware::new(clock.nominal_rate);
        return run(&clock, hardware.clone(), hardware, &shutdown);
    }

    let driver = ApeDriver::open(&clock.device)
        .with_context(|| format!("Failed to open {}", clock.device.display()))?;
    run(&clock, driver, open_controls(&clock)?, &shutdown)
}

#[cfg(feature = "alsa")]
fn open_controls(clock: &ClockConfig) -> Result<Box<dyn ControlSurface>> {
    if !clock.mode.sets_ratio() {
        return Ok(Box::new(NullHardware::new(clock.nominal_rate)));
    }
    let controls = avb_streamer::clock::AlsaControls::open(&clock.card)
        .with_context(|| format!("Failed to open mixer of card {}", clock.card))?;
    Ok(Box::new(controls))
}

#[cfg(not(feature = "alsa"))]
fn open_controls(clock: &ClockConfig) -> Result<Box<dyn ControlSurface>> {
    if clock.mode.sets_ratio() {
        tracing::warn!(
            "Built without mixer support; {} mode will only estimate",
            clock.mode
        );
    }
    Ok(Box::new(NullHardware::new(clock.nominal_rate)))
}

fn run<H, C>(clock: &ClockConfig, hardware: H, controls: C, shutdown: &ShutdownSignal) -> Result<()>
where
    H: ClockHardware + 'static,
    C: ControlSurface + 'static,
{
    let settle = clock.settle();
    if !settle.is_zero() {
        tracing::info!("Waiting {:?} for the audio path to settle", settle);
        if shutdown.wait_until(Duration::from_millis(100), waited(settle)) {
            return Ok(());
        }
    }

    let mut recovery = ClockRecovery::new(hardware, controls, RecoveryOptions::from_config(clock));
    recovery.start().context("Failed to initialise the clock driver")?;

    let channel = match RawChannel::open(&clock.interface) {
        Ok(channel) => channel,
        Err(e) => {
            recovery.stop();
            return Err(e).with_context(|| format!("Failed to open raw socket on {}", clock.interface));
        }
    };
    let mut handle = recovery.spawn(channel, clock.scheduling)?;
    tracing::info!(
        "CRF listener running on {} ({} mode, {} ms windows)",
        clock.interface,
        clock.mode,
        clock.interval_ms
    );

    shutdown.wait_until(Duration::from_millis(200), || handle.is_finished());
    if let Some(diagnostics) = handle.stop() {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    }
    Ok(())
}

fn waited(duration: Duration) -> impl FnMut() -> bool {
    let start = std::time::Instant::now();
    move || start.elapsed() >= duration
}
