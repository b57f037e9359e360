//! Link-layer transport for AVTP frames
//!
//! The stream loops talk to the wire through two small traits so they can be
//! driven by a real [`RawChannel`](raw::RawChannel) or by the in-process
//! [`loopback`] link.

pub mod loopback;
#[cfg(target_os = "linux")]
pub mod raw;

use crate::error::NetworkError;

pub use loopback::{loopback_pair, LoopbackSink, LoopbackSource};
#[cfg(target_os = "linux")]
pub use raw::RawChannel;

/// Receiving half of a link
pub trait FrameSource: Send {
    /// Block until a frame arrives or the receive timeout elapses.
    ///
    /// Returns `NetworkError::Timeout` on timeout and
    /// `NetworkError::ShortRead` when fewer than 14 bytes were read.
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError>;
}

/// Transmitting half of a link
pub trait FrameSink: Send {
    /// Transmit one frame, no retry
    fn send_frame(&mut self, frame: &[u8]) -> Result<usize, NetworkError>;

    /// MAC address of the transmitting interface
    fn hardware_addr(&mut self) -> Result<[u8; 6], NetworkError>;
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated) into bytes
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Format bytes as `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
