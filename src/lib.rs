//! # AVB Streamer
//!
//! IEEE 1722 (AVTP) media streaming over raw Ethernet with CRF media clock
//! recovery.
//!
//! ## Architecture Overview
//!
//! ```text
//!            TALKER                                   LISTENER
//!  ┌──────────────────────┐              ┌──────────────────────────────┐
//!  │ source buffer (TS)   │              │ RawChannel (AF_PACKET)       │
//!  │        │             │              │        │                     │
//!  │        ▼             │              │        ▼                     │
//!  │ StreamEgress         │   Ethernet   │ AvtpPacket::parse            │
//!  │  segment + pace      │ ───────────▶ │        │                     │
//!  │        │             │   0x22F0     │   ┌────┴─────────┐           │
//!  │        ▼             │              │   ▼              ▼           │
//!  │ PacketTemplate       │              │ StreamIngest   ClockRecovery │
//!  │        │             │              │  (payload →     (CRF →       │
//!  │        ▼             │              │   sink)          ASRC ratio) │
//!  │ RawChannel           │              │                              │
//!  └──────────────────────┘              └──────────────────────────────┘
//! ```
//!
//! Every loop runs on its own OS thread, owns its socket and scratch
//! buffers, and is stopped through a [`stream::StreamHandle`].

pub mod avtp;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod shutdown;
pub mod stream;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Raw socket receive timeout
    pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(15);

    /// Capture buffer size; larger than any standard Ethernet frame
    pub const MAX_FRAME_SIZE: usize = 2048;

    /// CRF measurement window
    pub const DEFAULT_WINDOW_INTERVAL: Duration = Duration::from_millis(150);

    /// Sample rate the recovered clock is compared against
    pub const NOMINAL_SAMPLE_RATE: u32 = 48_000;

    /// Period used when converting a rate into the driver's period registers
    pub const RATE_PERIOD_NS: u64 = 1_000_000_000;

    /// MPEG-TS packets per AVTP frame on the talker side
    pub const DEFAULT_TS_PER_FRAME: usize = 7;

    /// Sleep between two transmitted frames
    pub const DEFAULT_PACING: Duration = Duration::from_micros(250);

    /// VLAN the MPEG-TS talker tags its frames with
    pub const DEFAULT_TALKER_VLAN_ID: u16 = 200;

    /// Hardware clock driver node
    pub const DRIVER_DEVICE: &str = "/dev/eqos_ape_hw";

    /// Time given to the ASRC after the SRC switch before ratios are written
    pub const DEFAULT_SETTLE: Duration = Duration::from_secs(10);
}
