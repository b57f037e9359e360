//! Talker loop: source buffers in, paced AVTP frames out

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::StreamHandle;
use crate::avtp::builder::{DEFAULT_DEST_ADDR, DEFAULT_VLAN_PRIORITY};
use crate::avtp::{PacketTemplate, TalkerFormat};
use crate::config::{SchedulingConfig, TalkerConfig};
use crate::constants::{DEFAULT_PACING, DEFAULT_TALKER_VLAN_ID, DEFAULT_TS_PER_FRAME};
use crate::error::{Error, NetworkError, Result};
use crate::network::{format_mac, FrameSink};

/// Default SR class A transit budget added to the presentation time
pub const DEFAULT_PRESENTATION_OFFSET: Duration = Duration::from_millis(2);

/// Talker settings
#[derive(Debug, Clone, Copy)]
pub struct EgressOptions {
    pub format: TalkerFormat,
    /// Units (TS packets for MPEG-TS) per AVTP frame
    pub units_per_frame: usize,
    pub stream_index: u16,
    pub vlan_priority: u8,
    pub vlan_id: u16,
    pub destination: [u8; 6],
    /// Sleep after every transmitted frame
    pub pacing: Duration,
    pub presentation_offset: Duration,
    pub scheduling: SchedulingConfig,
}

impl Default for EgressOptions {
    fn default() -> Self {
        Self {
            format: TalkerFormat::Mpegts,
            units_per_frame: DEFAULT_TS_PER_FRAME,
            stream_index: 0,
            vlan_priority: DEFAULT_VLAN_PRIORITY,
            vlan_id: DEFAULT_TALKER_VLAN_ID,
            destination: DEFAULT_DEST_ADDR,
            pacing: DEFAULT_PACING,
            presentation_offset: DEFAULT_PRESENTATION_OFFSET,
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl EgressOptions {
    pub fn from_config(config: &TalkerConfig) -> Result<Self> {
        Ok(Self {
            units_per_frame: config.ts_per_frame,
            stream_index: config.stream_index,
            vlan_priority: config.vlan_priority,
            vlan_id: config.vlan_id,
            destination: config.destination()?,
            pacing: config.pacing(),
            scheduling: config.scheduling,
            ..Default::default()
        })
    }
}

/// Transmit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EgressStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub bytes_sent: u64,
    /// Frames sent during the last complete second
    pub last_second_pps: u64,
}

/// Stream id: interface MAC in the upper 48 bits, index in the lower 16
pub fn talker_stream_id(mac: [u8; 6], stream_index: u16) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&mac);
    bytes[6..].copy_from_slice(&stream_index.to_be_bytes());
    u64::from_be_bytes(bytes)
}

fn realtime_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Segments source buffers into AVTP frames and transmits them
pub struct StreamEgress<K: FrameSink> {
    sink: K,
    options: EgressOptions,
    template: Option<PacketTemplate>,
    stream_id: Option<u64>,
    clock: fn() -> u64,
    stats: EgressStats,
    second_start: Option<Instant>,
    second_count: u64,
}

impl<K: FrameSink> StreamEgress<K> {
    pub fn new(sink: K, options: EgressOptions) -> Self {
        Self {
            sink,
            options,
            template: None,
            stream_id: None,
            clock: realtime_ns,
            stats: EgressStats::default(),
            second_start: None,
            second_count: 0,
        }
    }

    /// Replace the nanosecond clock used for presentation times
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> EgressStats {
        self.stats
    }

    /// Stream id, known after the first `send`
    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    pub fn options(&self) -> &EgressOptions {
        &self.options
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn ensure_template(&mut self) -> Result<()> {
        if self.template.is_some() {
            return Ok(());
        }
        if self.options.units_per_frame == 0 {
            return Err(Error::Config("units_per_frame must be > 0".into()));
        }

        let mac = self.sink.hardware_addr()?;
        let stream_id = talker_stream_id(mac, self.options.stream_index);

        let mut template = PacketTemplate::new(self.options.format);
        template.write_static_header();
        template.set_dest_addr(self.options.destination);
        template.set_src_addr(mac);
        template.set_vlan_tag(self.options.vlan_priority, self.options.vlan_id);
        template.set_stream_id_valid(true);
        template.set_stream_id(stream_id);
        template.set_packet_size(self.options.units_per_frame)?;

        tracing::info!(
            "Talker ready: stream id {:016x}, source {}, destination {}, PCP {} VID {}, {} bytes/frame",
            stream_id,
            format_mac(&mac),
            format_mac(&self.options.destination),
            self.options.vlan_priority,
            self.options.vlan_id,
            template.packet_size()
        );

        self.stream_id = Some(stream_id);
        self.template = Some(template);
        Ok(())
    }

    /// Packetize and transmit `source`. Returns the number of frames handed to
    /// the sink; failed sends are counted and skipped.
    pub fn send(&mut self, source: &[u8]) -> Result<usize> {
        self.ensure_template()?;

        let unit = self.options.format.source_unit_size();
        let units = source.len() / unit;
        if units * unit != source.len() {
            tracing::debug!(
                "Ignoring {} trailing bytes that do not fill a unit",
                source.len() - units * unit
            );
        }

        let presentation_offset = self.options.presentation_offset.as_nanos() as u64;
        let group_bytes = self.options.units_per_frame * unit;
        let mut frames = 0;

        for chunk in source[..units * unit].chunks(group_bytes) {
            let presentation_time = (self.clock)().wrapping_add(presentation_offset) as u32;
            let template = match self.template.as_mut() {
                Some(template) => template,
                None => break,
            };
            template.set_dynamic_header(presentation_time);
            template.fill_payload(chunk, chunk.len() / unit)?;

            match self.sink.send_frame(template.as_frame()) {
                Ok(len) => {
                    self.stats.frames_sent += 1;
                    self.stats.bytes_sent += len as u64;
                }
                Err(e) => {
                    self.stats.send_failures += 1;
                    tracing::warn!("Frame send failed: {}", e);
                }
            }
            frames += 1;

            if !self.options.pacing.is_zero() {
                std::thread::sleep(self.options.pacing);
            }
            self.tick_rate_counter();
        }

        Ok(frames)
    }

    fn tick_rate_counter(&mut self) {
        let now = Instant::now();
        match self.second_start {
            Some(start) if now.duration_since(start) >= Duration::from_secs(1) => {
                self.stats.last_second_pps = self.second_count;
                tracing::debug!("Sent {} packets in last second", self.second_count);
                self.second_start = Some(now);
                self.second_count = 1;
            }
            Some(_) => self.second_count += 1,
            None => {
                self.second_start = Some(now);
                self.second_count = 1;
            }
        }
    }
}

/// Egress running on its own thread, fed through a bounded queue
pub struct EgressWorker {
    tx: Option<Sender<Bytes>>,
    handle: StreamHandle<EgressStats>,
}

impl EgressWorker {
    /// Start the talker thread; `capacity` bounds queued source buffers
    pub fn spawn<K>(mut egress: StreamEgress<K>, capacity: usize) -> Result<Self>
    where
        K: FrameSink + 'static,
    {
        let (tx, rx): (Sender<Bytes>, Receiver<Bytes>) = bounded(capacity.max(1));
        let scheduling = egress.options.scheduling;
        let handle = StreamHandle::spawn("avtp-egress", scheduling, move |stop| {
            while !stop.is_stopped() {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(buffer) => {
                        if let Err(e) = egress.send(&buffer) {
                            tracing::error!("Talker failed: {}", e);
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            let stats = egress.stats();
            tracing::info!(
                "Egress finished: {} frames sent, {} failed",
                stats.frames_sent,
                stats.send_failures
            );
            stats
        })?;

        Ok(Self {
            tx: Some(tx),
            handle,
        })
    }

    /// Queue a buffer, blocking while the queue is full
    pub fn submit(&self, buffer: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(NetworkError::Closed)?;
        tx.send(buffer).map_err(|_| NetworkError::Closed)?;
        Ok(())
    }

    /// Send everything already queued, then stop
    pub fn finish(mut self) -> Option<EgressStats> {
        self.tx.take();
        self.handle.wait();
        self.handle.stop()
    }

    /// Stop without draining the queue
    pub fn stop(&mut self) -> Option<EgressStats> {
        self.tx.take();
        self.handle.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avtp::{AvtpPacket, Subtype, SOURCE_PACKET_SIZE, TS_PACKET_SIZE};

    /// Records frames; fails every send whose index is in `fail_on`
    struct RecordingSink {
        frames: Vec<Vec<u8>>,
        attempts: usize,
        fail_on: Vec<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                frames: Vec::new(),
                attempts: 0,
                fail_on: Vec::new(),
            }
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&mut self, frame: &[u8]) -> std::result::Result<usize, NetworkError> {
            let attempt = self.attempts;
            self.attempts += 1;
            if self.fail_on.contains(&attempt) {
                return Err(NetworkError::SendFailed("injected".into()));
            }
            self.frames.push(frame.to_vec());
            Ok(frame.len())
        }

        fn hardware_addr(&mut self) -> std::result::Result<[u8; 6], NetworkError> {
            Ok([0x02, 0x11, 0x22, 0x33, 0x44, 0x55])
        }
    }

    fn fixed_clock() -> u64 {
        1_000
    }

    fn no_pacing() -> EgressOptions {
        EgressOptions {
            pacing: Duration::ZERO,
            stream_index: 0x0102,
            ..Default::default()
        }
    }

    fn ts_source(packets: usize) -> Vec<u8> {
        (0..packets)
            .flat_map(|p| {
                let mut ts = vec![p as u8; TS_PACKET_SIZE];
                ts[0] = 0x47;
                ts
            })
            .collect()
    }

    #[test]
    fn test_stream_id_layout() {
        assert_eq!(
            talker_stream_id([0x02, 0x11, 0x22, 0x33, 0x44, 0x55], 0x0102),
            0x0211_2233_4455_0102
        );
    }

    #[test]
    fn test_segments_into_groups_and_remainder() {
        let mut egress = StreamEgress::new(RecordingSink::new(), no_pacing()).with_clock(fixed_clock);
        assert_eq!(egress.send(&ts_source(16)).unwrap(), 3);

        let frames = &egress.sink().frames;
        let units: Vec<usize> = frames
            .iter()
            .map(|f| AvtpPacket::parse(f).unwrap().payload_size() as usize / SOURCE_PACKET_SIZE)
            .collect();
        assert_eq!(units, vec![7, 7, 2]);

        let packet = AvtpPacket::parse(&frames[2]).unwrap();
        assert_eq!(packet.subtype(), Subtype::Mpegts61883_4);
        assert_eq!(packet.stream_id(), 0x0211_2233_4455_0102);
        assert_eq!(packet.sequence_num(), 2);
        assert_eq!(&frames[0][..6], &DEFAULT_DEST_ADDR);
        assert_eq!(&frames[0][6..12], &[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

        let payload = packet.payload().unwrap();
        let expected_time = (1_000 + DEFAULT_PRESENTATION_OFFSET.as_nanos() as u64) as u32;
        assert_eq!(&payload[..4], &expected_time.to_be_bytes());
        assert_eq!(payload[5], 14);
        assert_eq!(egress.stats().frames_sent, 3);
    }

    #[test]
    fn test_trailing_partial_packet_is_ignored() {
        let mut egress = StreamEgress::new(RecordingSink::new(), no_pacing());
        let mut source = ts_source(3);
        source.extend_from_slice(&[0u8; 100]);
        assert_eq!(egress.send(&source).unwrap(), 1);
        assert_eq!(egress.send(&[0u8; 50]).unwrap(), 0);
    }

    #[test]
    fn test_send_failure_does_not_stall() {
        let mut sink = RecordingSink::new();
        sink.fail_on = vec![1];
        let mut egress = StreamEgress::new(sink, no_pacing());
        assert_eq!(egress.send(&ts_source(21)).unwrap(), 3);

        let stats = egress.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(egress.sink().frames.len(), 2);
    }

    #[test]
    fn test_vlan_tag_from_options() {
        let options = EgressOptions {
            vlan_priority: 2,
            vlan_id: 0x123,
            ..no_pacing()
        };
        let mut egress = StreamEgress::new(RecordingSink::new(), options);
        egress.send(&ts_source(1)).unwrap();
        let frame = &egress.sink().frames[0];
        assert_eq!(&frame[12..14], &[0x81, 0x00]);
        assert_eq!(u16::from_be_bytes([frame[14], frame[15]]), (2 << 13) | 0x123);
    }

    #[test]
    fn test_worker_drains_queue() {
        let (sink, mut source) = crate::network::loopback_pair(Duration::from_millis(50));
        let egress = StreamEgress::new(sink, no_pacing());
        let worker = EgressWorker::spawn(egress, 4).unwrap();
        worker.submit(Bytes::from(ts_source(7))).unwrap();
        worker.submit(Bytes::from(ts_source(3))).unwrap();
        let stats = worker.finish().unwrap();
        assert_eq!(stats.frames_sent, 2);

        use crate::network::FrameSource;
        let mut buf = [0u8; 2048];
        assert!(source.recv_frame(&mut buf).is_ok());
        assert!(source.recv_frame(&mut buf).is_ok());
    }
}
