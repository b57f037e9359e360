//! In-process link backed by a crossbeam channel
//!
//! Frames sent into a [`LoopbackSink`] come out of the paired
//! [`LoopbackSource`] in order. Used to wire a talker straight into a
//! listener without a NIC, and by the integration tests.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::{FrameSink, FrameSource};
use crate::avtp::ETH_HEADER_LEN;
use crate::error::NetworkError;

/// Locally administered address reported by loopback sinks
pub const LOOPBACK_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x17, 0x22];

/// Create a connected sink/source pair. `timeout` bounds each receive.
pub fn loopback_pair(timeout: Duration) -> (LoopbackSink, LoopbackSource) {
    let (tx, rx) = unbounded();
    (
        LoopbackSink { tx, mac: LOOPBACK_MAC },
        LoopbackSource { rx, timeout },
    )
}

/// Transmitting end
#[derive(Clone)]
pub struct LoopbackSink {
    tx: Sender<Vec<u8>>,
    mac: [u8; 6],
}

impl LoopbackSink {
    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    /// Push raw bytes onto the link as if they came off the wire
    pub fn inject(&self, frame: Vec<u8>) -> Result<(), NetworkError> {
        self.tx.send(frame).map_err(|_| NetworkError::Closed)
    }
}

impl FrameSink for LoopbackSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<usize, NetworkError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| NetworkError::SendFailed("loopback receiver dropped".into()))?;
        Ok(frame.len())
    }

    fn hardware_addr(&mut self) -> Result<[u8; 6], NetworkError> {
        Ok(self.mac)
    }
}

/// Receiving end
pub struct LoopbackSource {
    rx: Receiver<Vec<u8>>,
    timeout: Duration,
}

impl LoopbackSource {
    /// Frames queued and not yet received
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl FrameSource for LoopbackSource {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        let frame = match self.rx.recv_timeout(self.timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Err(NetworkError::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(NetworkError::Closed),
        };
        // Oversized frames are truncated like a raw socket would
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        if n < ETH_HEADER_LEN {
            return Err(NetworkError::ShortRead(n));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_arrive_in_order() {
        let (mut sink, mut source) = loopback_pair(Duration::from_millis(50));
        sink.send_frame(&[1u8; 20]).unwrap();
        sink.send_frame(&[2u8; 30]).unwrap();
        assert_eq!(source.pending(), 2);

        let mut buf = [0u8; 64];
        assert_eq!(source.recv_frame(&mut buf).unwrap(), 20);
        assert_eq!(buf[0], 1);
        assert_eq!(source.recv_frame(&mut buf).unwrap(), 30);
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_timeout_and_close() {
        let (sink, mut source) = loopback_pair(Duration::from_millis(10));
        let mut buf = [0u8; 64];
        assert!(matches!(source.recv_frame(&mut buf), Err(NetworkError::Timeout)));
        drop(sink);
        assert!(matches!(source.recv_frame(&mut buf), Err(NetworkError::Closed)));
    }

    #[test]
    fn test_short_read() {
        let (sink, mut source) = loopback_pair(Duration::from_millis(10));
        sink.inject(vec![0u8; 13]).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(source.recv_frame(&mut buf), Err(NetworkError::ShortRead(13))));
    }

    #[test]
    fn test_hardware_addr() {
        let (sink, _source) = loopback_pair(Duration::from_millis(10));
        let mut sink = sink.with_mac([0x02, 1, 2, 3, 4, 5]);
        assert_eq!(sink.hardware_addr().unwrap(), [0x02, 1, 2, 3, 4, 5]);
    }
}
