//! Clock recovery against scripted hardware

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use avb_streamer::avtp::{CrfPull, CrfType, PacketTemplate, TalkerFormat};
use avb_streamer::clock::{
    ClockHardware, ClockRecovery, ControlMap, ControlSurface, Drift, NullHardware, RateInfo,
    RateRatio, RecoveryOptions, RecoveryState,
};
use avb_streamer::config::{ClockMode, SchedulingConfig};
use avb_streamer::error::ClockError;
use avb_streamer::network::{loopback_pair, FrameSink};

const BASE_TS: u64 = 5_000_000_000;

struct CrfTalker {
    template: PacketTemplate,
}

impl CrfTalker {
    fn new() -> Self {
        let mut template = PacketTemplate::new(TalkerFormat::Crf {
            crf_type: CrfType::AudioSample,
            pull: CrfPull::One,
            base_frequency: 48_000,
            timestamp_interval: 1,
        });
        template.write_static_header();
        template.set_stream_id_valid(true);
        template.set_stream_id(0x0011_2233_4455_0007);
        template.set_packet_size(1).unwrap();
        Self { template }
    }

    fn frame(&mut self, timestamp: u64) -> Vec<u8> {
        self.template.set_dynamic_header(0);
        self.template
            .fill_payload(&timestamp.to_be_bytes(), 1)
            .unwrap();
        self.template.as_frame().to_vec()
    }
}

/// Driver double with shared call log
#[derive(Clone, Default)]
struct ScriptedDriver {
    calls: Arc<Mutex<Vec<&'static str>>>,
    drift: Drift,
}

impl ClockHardware for ScriptedDriver {
    fn get_rate(&mut self) -> Result<RateInfo, ClockError> {
        self.calls.lock().push("GET_RATE");
        Ok(RateInfo {
            rate: 48_000,
            ..RateInfo::default()
        })
    }

    fn init(&mut self, _rate: &RateInfo) -> Result<(), ClockError> {
        self.calls.lock().push("INIT");
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), ClockError> {
        self.calls.lock().push("DEINIT");
        Ok(())
    }

    fn freq_sync(&mut self) -> Result<Drift, ClockError> {
        self.calls.lock().push("FREQ_SYNC");
        Ok(self.drift)
    }

    fn phase_sync(&mut self) -> Result<Drift, ClockError> {
        Ok(self.drift)
    }
}

fn options(mode: ClockMode) -> RecoveryOptions {
    RecoveryOptions {
        mode,
        ..RecoveryOptions::default()
    }
}

fn asrc_controls() -> ControlMap {
    let mut controls = ControlMap::new();
    controls
        .define("ASRC1 Ratio2 Int", 0)
        .define("ASRC1 Ratio2 Frac", 0)
        .define("ASRC1 Ratio2 SRC", 0);
    controls
}

#[test]
fn test_7200_samples_in_150ms_is_48khz() {
    let mut talker = CrfTalker::new();
    let mut recovery = ClockRecovery::new(
        NullHardware::new(48_000),
        NullHardware::new(48_000),
        options(ClockMode::Estimate),
    );

    let mut report = None;
    for i in 0..=7200u64 {
        let ts = BASE_TS + i * 150_000_000 / 7200;
        // local time crosses 150 ms on the last packet only
        let now = i * 20_834;
        if let Some(r) = recovery.process_packet(&talker.frame(ts), now).unwrap() {
            assert_eq!(i, 7200);
            report = Some(r);
        }
    }

    let report = report.expect("window did not close");
    assert_eq!(report.frequency_hz, 48_000);
    assert_eq!(report.window.sample_count, 7200);
    assert_eq!(report.window.initial_timestamp, BASE_TS);
    assert_eq!(report.window.final_timestamp, BASE_TS + 150_000_000);
    assert!(!report.applied);
    assert_eq!(recovery.diagnostics().count, 1);
    assert_eq!(recovery.crf_params().unwrap().nominal_frequency(), 48_000.0);
}

#[test]
fn test_zero_initial_timestamp_yields_no_data_and_no_write() {
    let mut talker = CrfTalker::new();
    let mut recovery = ClockRecovery::new(
        ScriptedDriver::default(),
        asrc_controls(),
        options(ClockMode::Asrc),
    );

    assert!(matches!(
        recovery.process_packet(&talker.frame(0), 0),
        Err(ClockError::WindowNoData)
    ));
    assert_eq!(recovery.state(), RecoveryState::WaitingFirstWindow);
    assert_eq!(recovery.diagnostics().discarded_windows, 1);
    assert!(recovery
        .controls()
        .writes()
        .iter()
        .all(|(name, _)| !name.contains("Int") && !name.contains("Frac")));

    // a valid packet afterwards arms normally
    recovery
        .process_packet(&talker.frame(BASE_TS), Duration::from_millis(1).as_nanos() as u64)
        .unwrap();
    assert_eq!(recovery.state(), RecoveryState::Accumulating);
}

#[test]
fn test_i2s_master_ratio_and_lifecycle() {
    let driver = ScriptedDriver {
        drift: Drift {
            drift_num: 999_900,
            drift_den: 1_000_000,
        },
        ..ScriptedDriver::default()
    };
    let calls = driver.calls.clone();
    let mut talker = CrfTalker::new();
    let mut recovery = ClockRecovery::new(driver, asrc_controls(), options(ClockMode::I2sMaster));
    recovery.start().unwrap();

    let mut report = None;
    for i in 0..200u64 {
        // one packet per local millisecond, 1001 Hz in talker time
        let ts = BASE_TS + i * 1_000_000 * 1000 / 1001;
        if let Some(r) = recovery.process_packet(&talker.frame(ts), i * 1_000_000).unwrap() {
            report = Some(r);
            break;
        }
    }
    let report = report.unwrap();
    let expected = report.frequency_hz as f64 / 48_000.0 * 0.9999;
    assert!((report.ratio.unwrap() - expected).abs() < 1e-12);
    assert!(report.applied);

    let written = RateRatio::from_ratio(expected);
    assert_eq!(
        recovery.controls().value("ASRC1 Ratio2 Frac"),
        Some(written.fractional_part() as i64)
    );

    recovery.stop();
    assert_eq!(recovery.controls().value("ASRC1 Ratio2 Int"), Some(1));
    assert_eq!(recovery.controls().value("ASRC1 Ratio2 Frac"), Some(0));
    assert_eq!(
        *calls.lock(),
        vec!["GET_RATE", "INIT", "FREQ_SYNC", "FREQ_SYNC", "DEINIT"]
    );
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Controls that all fail, counting attempts
#[derive(Default)]
struct MissingControls {
    attempts: Arc<Mutex<usize>>,
}

impl ControlSurface for MissingControls {
    fn set_integer(&mut self, name: &str, _value: i64) -> Result<(), ClockError> {
        *self.attempts.lock() += 1;
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError> {
        *self.attempts.lock() += 1;
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }

    fn set_enumerated(&mut self, name: &str, _index: u32) -> Result<(), ClockError> {
        *self.attempts.lock() += 1;
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }
}

#[test]
fn test_missing_control_warned_once() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    let controls = MissingControls::default();
    let attempts = controls.attempts.clone();
    let mut talker = CrfTalker::new();
    let mut recovery =
        ClockRecovery::new(ScriptedDriver::default(), controls, options(ClockMode::Asrc));

    tracing::subscriber::with_default(subscriber, || {
        let mut now = 0u64;
        let mut ts = BASE_TS;
        let mut windows = 0;
        while windows < 3 {
            now += 1_000_000;
            ts += 1_000_000;
            if let Some(report) = recovery.process_packet(&talker.frame(ts), now).unwrap() {
                assert!(!report.applied);
                windows += 1;
            }
        }
    });

    assert_eq!(recovery.diagnostics().count, 3);
    // SRC once, then one Int attempt per window
    assert_eq!(*attempts.lock(), 4);

    let log = String::from_utf8(capture.0.lock().clone()).unwrap();
    assert_eq!(log.matches("ASRC1 Ratio2 Int").count(), 1);
    assert_eq!(log.matches("ASRC1 Ratio2 SRC").count(), 1);
    assert_eq!(log.matches("ASRC1 Ratio2 Frac").count(), 0);
}

#[test]
fn test_recovery_thread_over_loopback() {
    let (mut link, source) = loopback_pair(Duration::from_millis(10));
    let mut talker = CrfTalker::new();
    for i in 0..10u64 {
        link.send_frame(&talker.frame(BASE_TS + i * 1_000_000)).unwrap();
    }

    let driver = ScriptedDriver::default();
    let calls = driver.calls.clone();
    let mut recovery = ClockRecovery::new(driver, asrc_controls(), options(ClockMode::Asrc));
    recovery.start().unwrap();

    let mut handle = recovery
        .spawn(source, SchedulingConfig::default())
        .unwrap();
    drop(link);
    assert!(handle.wait_timeout(Duration::from_secs(2)));

    let diagnostics = handle.stop().unwrap();
    assert_eq!(diagnostics.count, 0);
    // the first packet arms a window, which is never closed
    assert_eq!(
        *calls.lock(),
        vec!["GET_RATE", "INIT", "FREQ_SYNC", "DEINIT"]
    );
}
