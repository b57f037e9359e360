//! CRF media clock recovery
//!
//! Incoming CRF packets are grouped into measurement windows. At the end of
//! each window the media clock frequency is estimated from the advance of the
//! CRF timestamps, and, depending on [`ClockMode`], a correction ratio is
//! programmed into the ASRC:
//!
//! ```text
//!   estimate    no writes
//!   asrc        ratio = f / nominal
//!   i2s_master  ratio = f / nominal * gPTP drift
//!   i2s_slave   ratio = f / nominal * gPTP drift * ARAD ratio
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;

use crate::avtp::{AvtpPacket, CrfParams, Subtype};
use crate::clock::hardware::{
    arad_ratio_frac, arad_ratio_int, asrc_ratio_frac, asrc_ratio_int, asrc_ratio_src,
    ClockHardware, ControlSurface,
};
use crate::clock::rate::{compute_rate_info, RateInfo, RateRatio};
use crate::config::{ClockConfig, ClockMode, SchedulingConfig};
use crate::constants::{MAX_FRAME_SIZE, RATE_PERIOD_NS};
use crate::error::{ClockError, NetworkError, Result};
use crate::network::FrameSource;
use crate::stream::{StopSignal, StreamHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub interval: Duration,
    pub nominal_rate: u32,
    pub asrc_stream: u8,
    pub arad_lane: u8,
    pub mode: ClockMode,
    /// Enumeration index selecting the software ratio source
    pub src_sw_index: u32,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::from_config(&ClockConfig::default())
    }
}

impl RecoveryOptions {
    pub fn from_config(config: &ClockConfig) -> Self {
        Self {
            interval: config.interval(),
            nominal_rate: config.nominal_rate,
            asrc_stream: config.asrc_stream,
            arad_lane: config.arad_lane,
            mode: config.mode,
            src_sw_index: config.src_sw_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    WaitingFirstWindow,
    Accumulating,
    Publishing,
}

/// One measurement window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrequencyEstimate {
    /// Local monotonic time at which the window was armed
    pub start_time_ns: u64,
    pub initial_timestamp: u64,
    pub final_timestamp: u64,
    /// Timestamps received after the initial one
    pub sample_count: u64,
}

impl FrequencyEstimate {
    pub fn frequency(&self, timestamp_interval: u32) -> std::result::Result<u32, ClockError> {
        estimate_frequency(
            self.sample_count,
            timestamp_interval,
            self.initial_timestamp,
            self.final_timestamp,
        )
    }
}

/// `round(1e9 * samples * interval / (final - initial))`
///
/// Zero timestamps, an empty window, and a timestamp that did not advance all
/// yield [`ClockError::WindowNoData`].
pub fn estimate_frequency(
    sample_count: u64,
    timestamp_interval: u32,
    initial_timestamp: u64,
    final_timestamp: u64,
) -> std::result::Result<u32, ClockError> {
    if initial_timestamp == 0 || final_timestamp == 0 || sample_count == 0 {
        return Err(ClockError::WindowNoData);
    }
    if timestamp_interval == 0 || final_timestamp <= initial_timestamp {
        return Err(ClockError::WindowNoData);
    }

    let elapsed = (final_timestamp - initial_timestamp) as u128;
    let numerator = 1_000_000_000u128 * sample_count as u128 * timestamp_interval as u128;
    let frequency = (numerator + elapsed / 2) / elapsed;
    u32::try_from(frequency).map_err(|_| ClockError::WindowNoData)
}

/// Running statistics over published windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub sum: u64,
    pub count: u64,
    pub discarded_windows: u64,
}

impl Diagnostics {
    pub fn record(&mut self, frequency: u32) {
        self.min = Some(self.min.map_or(frequency, |m| m.min(frequency)));
        self.max = Some(self.max.map_or(frequency, |m| m.max(frequency)));
        self.sum += frequency as u64;
        self.count += 1;
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum as f64 / self.count as f64)
    }

    pub fn log_summary(&self) {
        match (self.min, self.max, self.average()) {
            (Some(min), Some(max), Some(avg)) => tracing::info!(
                "Clock recovery: {} windows, min {} Hz, max {} Hz, average {:.3} Hz, {} discarded",
                self.count,
                min,
                max,
                avg,
                self.discarded_windows
            ),
            _ => tracing::info!(
                "Clock recovery: no complete window, {} discarded",
                self.discarded_windows
            ),
        }
    }
}

/// Result of one closed window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowReport {
    pub frequency_hz: u32,
    pub window: FrequencyEstimate,
    /// Combined correction ratio, when the mode computes one and every
    /// factor was available
    pub ratio: Option<f64>,
    pub rate_ratio: Option<RateRatio>,
    /// True when the ratio reached the ASRC controls
    pub applied: bool,
}

pub struct ClockRecovery<H: ClockHardware, C: ControlSurface> {
    hardware: H,
    controls: C,
    options: RecoveryOptions,
    state: RecoveryState,
    window: FrequencyEstimate,
    crf_params: Option<CrfParams>,
    diagnostics: Diagnostics,
    /// Controls and commands already reported as failing
    reported: HashSet<String>,
    started: bool,
}

impl<H: ClockHardware, C: ControlSurface> ClockRecovery<H, C> {
    pub fn new(hardware: H, controls: C, options: RecoveryOptions) -> Self {
        Self {
            hardware,
            controls,
            options,
            state: RecoveryState::WaitingFirstWindow,
            window: FrequencyEstimate::default(),
            crf_params: None,
            diagnostics: Diagnostics::default(),
            reported: HashSet::new(),
            started: false,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn crf_params(&self) -> Option<CrfParams> {
        self.crf_params
    }

    /// Window currently being accumulated
    pub fn window(&self) -> FrequencyEstimate {
        self.window
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn controls(&self) -> &C {
        &self.controls
    }

    /// Program the driver's period registers from its current rate
    pub fn start(&mut self) -> std::result::Result<RateInfo, ClockError> {
        let current = self.hardware.get_rate()?;
        let info = compute_rate_info(current.rate, RATE_PERIOD_NS)?;
        self.hardware.init(&info)?;
        self.started = true;
        tracing::info!("Clock recovery started in {} mode", self.options.mode);
        Ok(info)
    }

    /// Return the ASRC to unity, release the driver and log the statistics.
    /// Safe to call more than once.
    pub fn stop(&mut self) -> Diagnostics {
        if self.started {
            self.started = false;
            if self.options.mode.sets_ratio() {
                if let Err(e) = self.write_asrc_ratio(RateRatio::UNITY) {
                    tracing::warn!("Could not restore unity ASRC ratio: {}", e);
                }
            }
            if let Err(e) = self.hardware.deinit() {
                tracing::error!("Clock driver deinit failed: {}", e);
            }
            self.diagnostics.log_summary();
        }
        self.diagnostics
    }

    /// Feed one captured frame. Non-CRF frames are ignored.
    ///
    /// Returns a report when the frame closed a window; `WindowNoData` when
    /// the window had to be thrown away.
    pub fn process_packet(
        &mut self,
        frame: &[u8],
        now_ns: u64,
    ) -> std::result::Result<Option<WindowReport>, ClockError> {
        let packet = match AvtpPacket::parse(frame) {
            Ok(packet) if packet.subtype() == Subtype::Crf => packet,
            _ => return Ok(None),
        };
        let params = match packet.crf_params() {
            Some(params) => params,
            None => return Ok(None),
        };
        if self.crf_params.is_none() {
            self.on_first_packet(&params);
        }
        self.crf_params = Some(params);

        let timestamp = packet.crf_timestamps().next().unwrap_or(0);
        match self.state {
            RecoveryState::WaitingFirstWindow | RecoveryState::Publishing => {
                self.arm(timestamp, now_ns)?;
                Ok(None)
            }
            RecoveryState::Accumulating => {
                if timestamp == 0 {
                    return Err(self.discard());
                }
                self.window.final_timestamp = timestamp;
                self.window.sample_count += params.timestamps_per_packet().max(1) as u64;

                let elapsed = now_ns.saturating_sub(self.window.start_time_ns);
                if elapsed as u128 > self.options.interval.as_nanos() {
                    self.publish(&params).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn on_first_packet(&mut self, params: &CrfParams) {
        tracing::info!(
            "First CRF packet: {:?} at {} Hz nominal, {} samples per timestamp",
            params.crf_type,
            params.nominal_frequency(),
            params.timestamp_interval
        );
        if self.options.mode.sets_ratio() {
            let name = asrc_ratio_src(self.options.asrc_stream);
            if let Err(e) = self
                .controls
                .set_enumerated(&name, self.options.src_sw_index)
            {
                self.report_once(&name, &e);
            }
        }
    }

    fn arm(&mut self, timestamp: u64, now_ns: u64) -> std::result::Result<(), ClockError> {
        if timestamp == 0 {
            return Err(self.discard());
        }
        self.window = FrequencyEstimate {
            start_time_ns: now_ns,
            initial_timestamp: timestamp,
            final_timestamp: 0,
            sample_count: 0,
        };
        // Baseline for the drift read at the end of the window
        if let Err(e) = self.hardware.freq_sync() {
            self.report_once("FREQ_SYNC", &e);
        }
        self.state = RecoveryState::Accumulating;
        Ok(())
    }

    fn discard(&mut self) -> ClockError {
        self.diagnostics.discarded_windows += 1;
        self.state = RecoveryState::WaitingFirstWindow;
        tracing::debug!("Discarding window without usable timestamps");
        ClockError::WindowNoData
    }

    fn publish(&mut self, params: &CrfParams) -> std::result::Result<WindowReport, ClockError> {
        let frequency = match self.window.frequency(params.timestamp_interval as u32) {
            Ok(frequency) => frequency,
            Err(e) => {
                self.discard();
                return Err(e);
            }
        };
        self.diagnostics.record(frequency);
        self.state = RecoveryState::Publishing;

        let mut report = WindowReport {
            frequency_hz: frequency,
            window: self.window,
            ratio: None,
            rate_ratio: None,
            applied: false,
        };
        if !self.options.mode.sets_ratio() {
            tracing::info!("Frequency {} Hz", frequency);
            return Ok(report);
        }

        let ratio1 = frequency as f64 / self.options.nominal_rate as f64;
        let ratio2 = if self.options.mode.uses_drift() {
            self.read_drift()
        } else {
            Some(1.0)
        };
        let ratio3 = if self.options.mode.uses_arad() {
            self.read_arad_ratio()
        } else {
            Some(1.0)
        };

        if let (Some(ratio2), Some(ratio3)) = (ratio2, ratio3) {
            let ratio = ratio1 * ratio2 * ratio3;
            let rate_ratio = RateRatio::from_ratio(ratio);
            report.ratio = Some(ratio);
            report.rate_ratio = Some(rate_ratio);
            report.applied = self.write_asrc_ratio(rate_ratio).is_ok();
            tracing::info!(
                "Frequency {} Hz, ratio1 {:.9} ratio2 {:.9} ratio3 {:.9} ratio {:.9}",
                frequency,
                ratio1,
                ratio2,
                ratio3,
                ratio
            );
        } else {
            tracing::info!("Frequency {} Hz, ratio not applied", frequency);
        }
        Ok(report)
    }

    fn read_drift(&mut self) -> Option<f64> {
        match self.hardware.freq_sync() {
            Ok(drift) => {
                let ratio = drift.ratio();
                if ratio.is_none() {
                    tracing::debug!("Driver reported empty drift {:?}", drift);
                }
                ratio
            }
            Err(e) => {
                self.report_once("FREQ_SYNC", &e);
                None
            }
        }
    }

    fn read_arad_ratio(&mut self) -> Option<f64> {
        let int_name = arad_ratio_int(self.options.arad_lane);
        let frac_name = arad_ratio_frac(self.options.arad_lane);
        let integer = match self.controls.get_integer(&int_name) {
            Ok(value) => value,
            Err(e) => {
                self.report_once(&int_name, &e);
                return None;
            }
        };
        let fractional = match self.controls.get_integer(&frac_name) {
            Ok(value) => value,
            Err(e) => {
                self.report_once(&frac_name, &e);
                return None;
            }
        };
        Some(RateRatio::from_parts(integer as u32, fractional as u32).as_f64())
    }

    fn write_asrc_ratio(&mut self, ratio: RateRatio) -> std::result::Result<(), ClockError> {
        for (name, value) in [
            (
                asrc_ratio_int(self.options.asrc_stream),
                ratio.integer_part(),
            ),
            (
                asrc_ratio_frac(self.options.asrc_stream),
                ratio.fractional_part(),
            ),
        ] {
            if let Err(e) = self.controls.set_integer(&name, value as i64) {
                self.report_once(&name, &e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn report_once(&mut self, key: &str, error: &ClockError) {
        if self.reported.insert(key.to_string()) {
            tracing::warn!("{} (further failures are not reported)", error);
        }
    }
}

impl<H, C> ClockRecovery<H, C>
where
    H: ClockHardware + 'static,
    C: ControlSurface + 'static,
{
    /// Run the receive loop on its own thread. The handle yields the final
    /// statistics once the driver has been released.
    pub fn spawn<S>(
        self,
        source: S,
        scheduling: SchedulingConfig,
    ) -> Result<StreamHandle<Diagnostics>>
    where
        S: FrameSource + 'static,
    {
        StreamHandle::spawn("crf-listener", scheduling, move |stop| {
            run_recovery(self, source, stop)
        })
    }
}

/// Receive loop; returns when stopped or the source fails
pub fn run_recovery<H, C, S>(
    mut recovery: ClockRecovery<H, C>,
    mut source: S,
    stop: StopSignal,
) -> Diagnostics
where
    H: ClockHardware,
    C: ControlSurface,
    S: FrameSource,
{
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    while !stop.is_stopped() {
        let len = match source.recv_frame(&mut buf) {
            Ok(len) => len,
            Err(NetworkError::Timeout) => continue,
            Err(NetworkError::ShortRead(len)) => {
                tracing::warn!("Short read of {} bytes", len);
                continue;
            }
            Err(e) => {
                tracing::error!("CRF receive failed: {}", e);
                break;
            }
        };
        match recovery.process_packet(&buf[..len], monotonic_ns()) {
            Ok(Some(report)) => {
                tracing::debug!("Window closed: {:?}", report);
            }
            Ok(None) => {}
            Err(ClockError::WindowNoData) => {}
            Err(e) => tracing::warn!("Clock recovery: {}", e),
        }
    }
    drop(source);
    recovery.stop()
}

/// CLOCK_MONOTONIC in nanoseconds
pub fn monotonic_ns() -> u64 {
    #[cfg(unix)]
    {
        use nix::time::{clock_gettime, ClockId};
        if let Ok(ts) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
            return ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64;
        }
    }
    fallback_ns()
}

fn fallback_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
