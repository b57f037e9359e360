//! Error types for the AVB streaming stack

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("AVTP error: {0}")]
    Avtp(#[from] AvtpError),

    #[error("Clock recovery error: {0}")]
    Clock(#[from] ClockError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link-layer socket errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to open raw socket on {interface}: {source}")]
    SocketOpenFailed {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Short read: {0} bytes is below the Ethernet header size")]
    ShortRead(usize),

    #[error("Receive timed out")]
    Timeout,

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    Closed,
}

/// AVTP parsing and construction errors
///
/// Everything except `PayloadTooLarge` is a per-frame condition: the ingest
/// loop drops the frame and carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvtpError {
    #[error("Not an AVTP frame")]
    NotAvtp,

    #[error("Unsupported AVTP subtype: 0x{0:02x}")]
    UnsupportedSubtype(u8),

    #[error("Truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Stream id mismatch: expected {expected:016x}, found {found:016x}")]
    StreamIdMismatch { expected: u64, found: u64 },

    #[error("Payload too large: {units} units, template holds {max}")]
    PayloadTooLarge { units: usize, max: usize },

    #[error("Frame too large: {len} bytes, limit {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Clock recovery and hardware control errors
#[derive(Error, Debug)]
pub enum ClockError {
    #[error("Measurement window has no usable CRF timestamps")]
    WindowNoData,

    #[error("Hardware control unavailable: {0}")]
    HardwareControlUnavailable(String),

    #[error("Driver command {command} failed: {source}")]
    DriverCommandFailed {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid sample rate: {0}")]
    InvalidRate(u32),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
