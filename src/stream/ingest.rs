//! Listener loop: frames in, payloads out
//!
//! `recv` → 1722 check → header parse → subtype / stream id filter →
//! first-packet parameter capture → payload extraction → sink.
//! Every malformed or filtered frame is dropped at debug level; only a dead
//! frame source ends the loop.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{StopSignal, StreamHandle};
use crate::avtp::{AafParams, AvtpPacket, CipHeader, CrfParams, Subtype};
use crate::config::{ListenerConfig, SchedulingConfig};
use crate::constants::MAX_FRAME_SIZE;
use crate::error::{AvtpError, Error, NetworkError, Result};
use crate::network::FrameSource;

/// Consumer of extracted payloads
pub trait PayloadSink: Send {
    fn on_payload(&mut self, stream_id: u64, subtype: Subtype, payload: &[u8]) -> Result<()>;

    /// Called once when the loop exits
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> PayloadSink for F
where
    F: FnMut(u64, Subtype, &[u8]) + Send,
{
    fn on_payload(&mut self, stream_id: u64, subtype: Subtype, payload: &[u8]) -> Result<()> {
        self(stream_id, subtype, payload);
        Ok(())
    }
}

/// Writes payload bytes back to back into any writer
pub struct WriterSink<W: Write + Send> {
    writer: W,
    bytes_written: u64,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PayloadSink for WriterSink<W> {
    fn on_payload(&mut self, _stream_id: u64, _subtype: Subtype, payload: &[u8]) -> Result<()> {
        self.writer.write_all(payload)?;
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Payload dump to a file (the `file*` listener modes)
pub type FileSink = WriterSink<BufWriter<File>>;

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        tracing::info!("Writing payloads to {}", path.display());
        Ok(WriterSink::new(BufWriter::new(file)))
    }
}

/// One dispatched payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub stream_id: u64,
    pub subtype: Subtype,
    pub data: Bytes,
}

/// Forwards payloads to another thread
pub struct ChannelSink {
    tx: Sender<ReceivedPayload>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: Sender<ReceivedPayload>) -> Self {
        Self { tx, dropped: 0 }
    }

    /// Payloads lost to a full channel
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl PayloadSink for ChannelSink {
    fn on_payload(&mut self, stream_id: u64, subtype: Subtype, payload: &[u8]) -> Result<()> {
        let item = ReceivedPayload {
            stream_id,
            subtype,
            data: Bytes::copy_from_slice(payload),
        };
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!("Payload channel full, dropping payload");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(NetworkError::Closed.into()),
        }
    }
}

/// Listener behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Only this stream is accepted; `None` accepts any
    pub stream_id: Option<u64>,
    /// Only this subtype is accepted; `None` accepts any known subtype
    pub subtype: Option<Subtype>,
    /// Keep the first quadlet of every 16 payload bytes
    pub decimate: bool,
    /// Lock onto the first stream seen when no stream id is configured
    pub pin_stream: bool,
    pub scheduling: SchedulingConfig,
}

impl IngestOptions {
    pub fn from_config(config: &ListenerConfig) -> Result<Self> {
        Ok(Self {
            stream_id: config.stream_id()?,
            subtype: Some(config.mode.subtype()),
            decimate: config.mode.decimates(),
            pin_stream: config.mode.pins_stream(),
            scheduling: config.scheduling,
        })
    }
}

/// Counters kept by the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Frames handed over by the source
    pub frames: u64,
    pub accepted: u64,
    pub dispatched: u64,
    pub not_avtp: u64,
    /// Wrong subtype or stream id
    pub filtered: u64,
    /// Truncated header or payload past the captured length
    pub unconsumable: u64,
    pub short_reads: u64,
    pub sink_errors: u64,
    /// Payload bytes dispatched
    pub bytes: u64,
}

/// Per-stream state owned by the loop thread
pub struct StreamContext {
    configured_stream_id: Option<u64>,
    expected_stream_id: Option<u64>,
    subtype_filter: Option<Subtype>,
    decimate: bool,
    pin_stream: bool,
    first_packet_seen: bool,
    packet_count: u64,
    scratch: BytesMut,
    cip: Option<CipHeader>,
    aaf_params: Option<AafParams>,
    crf_params: Option<CrfParams>,
    stats: IngestStats,
}

impl StreamContext {
    pub fn new(options: &IngestOptions) -> Self {
        Self {
            configured_stream_id: options.stream_id,
            expected_stream_id: options.stream_id,
            subtype_filter: options.subtype,
            decimate: options.decimate,
            pin_stream: options.pin_stream,
            first_packet_seen: false,
            packet_count: 0,
            scratch: BytesMut::with_capacity(MAX_FRAME_SIZE),
            cip: None,
            aaf_params: None,
            crf_params: None,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn expected_stream_id(&self) -> Option<u64> {
        self.expected_stream_id
    }

    pub fn aaf_params(&self) -> Option<AafParams> {
        self.aaf_params
    }

    pub fn crf_params(&self) -> Option<CrfParams> {
        self.crf_params
    }

    pub fn cip_header(&self) -> Option<CipHeader> {
        self.cip
    }

    /// Forget the pinned stream and cached parameters
    pub fn reset(&mut self) {
        self.expected_stream_id = self.configured_stream_id;
        self.first_packet_seen = false;
        self.cip = None;
        self.aaf_params = None;
        self.crf_params = None;
    }

    /// Run one captured frame through the pipeline. Returns the number of
    /// bytes dispatched; dropped frames come back as the reason they were
    /// dropped.
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        sink: &mut dyn PayloadSink,
    ) -> std::result::Result<usize, AvtpError> {
        self.stats.frames += 1;

        let packet = match AvtpPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                if e == AvtpError::NotAvtp {
                    self.stats.not_avtp += 1;
                } else {
                    self.stats.unconsumable += 1;
                }
                tracing::debug!("Dropping frame of {} bytes: {}", frame.len(), e);
                return Err(e);
            }
        };

        let subtype = packet.subtype();
        let wanted = match self.subtype_filter {
            Some(filter) => subtype == filter,
            None => subtype.is_known(),
        };
        if !wanted {
            self.stats.filtered += 1;
            tracing::debug!("Dropping {} packet", subtype);
            return Err(AvtpError::UnsupportedSubtype(subtype.code()));
        }

        let stream_id = packet.stream_id();
        if let Some(expected) = self.expected_stream_id {
            if stream_id != expected {
                self.stats.filtered += 1;
                let e = AvtpError::StreamIdMismatch {
                    expected,
                    found: stream_id,
                };
                tracing::debug!("Dropping packet: {}", e);
                return Err(e);
            }
        }

        self.stats.accepted += 1;
        self.packet_count += 1;
        if !self.first_packet_seen {
            self.capture_parameters(&packet);
        }

        let size = packet.payload_size() as usize;
        if size == 0 {
            self.stats.unconsumable += 1;
            tracing::debug!("Unconsumable {} packet from {:016x}", subtype, stream_id);
            return Ok(0);
        }

        self.scratch.clear();
        self.scratch.resize(size, 0);
        packet.extract_payload(&mut self.scratch)?;
        if self.decimate {
            decimate_audio8(&mut self.scratch);
        }

        match sink.on_payload(stream_id, subtype, &self.scratch) {
            Ok(()) => {
                self.stats.dispatched += 1;
                self.stats.bytes += self.scratch.len() as u64;
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                tracing::warn!("Payload sink failed: {}", e);
            }
        }
        Ok(self.scratch.len())
    }

    fn capture_parameters(&mut self, packet: &AvtpPacket<'_>) {
        let stream_id = packet.stream_id();
        tracing::info!(
            "First packet: stream id {:016x}, subtype {}",
            stream_id,
            packet.subtype()
        );

        match packet.subtype() {
            Subtype::Aaf => {
                self.aaf_params = packet.aaf_params();
                if let Some(params) = &self.aaf_params {
                    tracing::info!(
                        "AAF stream: {:?}, {} channels, {} Hz, {} bit",
                        params.format,
                        params.channels_per_frame,
                        params.sampling_rate,
                        params.bit_depth
                    );
                }
            }
            Subtype::Crf => {
                self.crf_params = packet.crf_params();
                if let Some(params) = &self.crf_params {
                    tracing::info!(
                        "CRF stream: {:?}, nominal {:.3} Hz, interval {}",
                        params.crf_type,
                        params.nominal_frequency(),
                        params.timestamp_interval
                    );
                }
            }
            Subtype::Audio61883_6 | Subtype::Mpegts61883_4 => {
                self.cip = packet.cip_header();
                if let Some(cip) = &self.cip {
                    tracing::info!("IEC 61883 stream: FMT 0x{:02x}, DBS {}", cip.fmt, cip.dbs);
                }
            }
            Subtype::Cvf | Subtype::Unknown(_) => {}
        }

        if self.pin_stream && self.expected_stream_id.is_none() {
            tracing::info!("Pinned stream {:016x}", stream_id);
            self.expected_stream_id = Some(stream_id);
        }
        self.first_packet_seen = true;
    }
}

/// Keep the first quadlet of every 16-byte group (8-channel AM824 down to
/// its first channel pair)
pub fn decimate_audio8(payload: &mut BytesMut) {
    let groups = payload.len() / 16;
    for group in 0..groups {
        payload.copy_within(group * 16..group * 16 + 4, group * 4);
    }
    payload.truncate(groups * 4);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Capturing,
    Stopped,
}

/// A listener stream: owns the loop thread while capturing
pub struct StreamIngest {
    options: IngestOptions,
    state: IngestState,
    handle: Option<StreamHandle<IngestStats>>,
    live_stats: Arc<Mutex<IngestStats>>,
    final_stats: Option<IngestStats>,
}

impl StreamIngest {
    pub fn new(options: IngestOptions) -> Self {
        Self {
            options,
            state: IngestState::Idle,
            handle: None,
            live_stats: Arc::new(Mutex::new(IngestStats::default())),
            final_stats: None,
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Start capturing from `source` into `sink` on a new thread
    pub fn start<S, P>(&mut self, source: S, sink: P) -> Result<()>
    where
        S: FrameSource + 'static,
        P: PayloadSink + 'static,
    {
        if self.state != IngestState::Idle {
            return Err(Error::InvalidState(format!(
                "ingest cannot start while {:?}",
                self.state
            )));
        }

        let context = StreamContext::new(&self.options);
        let live_stats = self.live_stats.clone();
        let handle = StreamHandle::spawn("avtp-ingest", self.options.scheduling, move |stop| {
            run_ingest(source, sink, context, stop, live_stats)
        })?;

        self.handle = Some(handle);
        self.state = IngestState::Capturing;
        Ok(())
    }

    /// Open a raw socket on `interface` and start capturing from it
    #[cfg(target_os = "linux")]
    pub fn start_on_interface<P>(&mut self, interface: &str, timeout: Duration, sink: P) -> Result<()>
    where
        P: PayloadSink + 'static,
    {
        let channel = crate::network::RawChannel::open_with_timeout(interface, timeout)?;
        self.start(channel, sink)
    }

    /// Counters as of the last processed frame
    pub fn stats(&self) -> IngestStats {
        self.final_stats.unwrap_or_else(|| *self.live_stats.lock())
    }

    /// True once the loop thread has exited on its own (source closed)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Wait for the loop to exit after a stop request
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.wait_timeout(timeout))
            .unwrap_or(true)
    }

    /// Ask the loop to exit without joining
    pub fn request_stop(&self) {
        if let Some(handle) = &self.handle {
            handle.request_stop();
        }
    }

    /// Stop capturing and release the source. Idempotent.
    pub fn stop(&mut self) -> IngestStats {
        if let Some(mut handle) = self.handle.take() {
            if let Some(stats) = handle.stop() {
                self.final_stats = Some(stats);
            }
        }
        if self.state != IngestState::Idle {
            self.state = IngestState::Stopped;
        }
        self.stats()
    }
}

impl Drop for StreamIngest {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ingest<S, P>(
    mut source: S,
    mut sink: P,
    mut context: StreamContext,
    stop: StopSignal,
    live_stats: Arc<Mutex<IngestStats>>,
) -> IngestStats
where
    S: FrameSource,
    P: PayloadSink,
{
    let mut frame = vec![0u8; MAX_FRAME_SIZE];

    while !stop.is_stopped() {
        match source.recv_frame(&mut frame) {
            Ok(len) => {
                let _ = context.handle_frame(&frame[..len], &mut sink);
            }
            Err(NetworkError::Timeout) => {
                tracing::debug!("No frame within the receive timeout");
            }
            Err(NetworkError::ShortRead(len)) => {
                context.stats.short_reads += 1;
                tracing::debug!("Short read of {} bytes", len);
            }
            Err(e) => {
                tracing::error!("Frame source failed, stopping ingest: {}", e);
                break;
            }
        }
        *live_stats.lock() = context.stats();
    }

    if let Err(e) = sink.finish() {
        tracing::warn!("Payload sink failed to finish: {}", e);
    }
    drop(source);

    let stats = context.stats();
    *live_stats.lock() = stats;
    tracing::info!(
        "Ingest finished: {} frames, {} dispatched, {} bytes",
        stats.frames,
        stats.dispatched,
        stats.bytes
    );
    stats
}

/// Build a file sink for the configured output
pub fn file_sink_for(config: &ListenerConfig) -> Result<(FileSink, PathBuf)> {
    let path = config.output_path();
    let sink = FileSink::create(&path)?;
    Ok((sink, path))
}
