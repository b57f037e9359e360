//! Application configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or no file
//! at all) yields a usable configuration. Command line flags are applied on
//! top by the binaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::avtp::builder::{DEFAULT_DEST_ADDR, DEFAULT_VLAN_PRIORITY};
use crate::avtp::Subtype;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::{format_mac, parse_mac};

/// Highest ASRC stream / ARAD lane index
pub const MAX_ASRC_STREAM: u8 = 6;

/// Highest TS packet count that still fits a standard MTU
pub const MAX_TS_PER_FRAME: usize = 7;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listener: ListenerConfig,
    pub talker: TalkerConfig,
    pub clock: ClockConfig,
}

/// OS scheduling class for a stream thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    Rr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub policy: SchedPolicy,
    /// 1..=99 for `fifo`/`rr`, ignored for `other`
    pub priority: u8,
}

impl SchedulingConfig {
    pub fn realtime(priority: u8) -> Self {
        Self {
            policy: SchedPolicy::Rr,
            priority,
        }
    }
}

/// What the listener extracts and where it goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    #[default]
    Mpegts,
    Cvf,
    Audio,
    /// 61883-6 audio reduced to the first quadlet of every 16 bytes
    Audio8,
    Aaf,
    FileMpegts,
    FileAudio,
    FileAudio8,
    FileAaf,
    FileCvf,
}

impl ListenerMode {
    pub const ALL: [ListenerMode; 10] = [
        ListenerMode::Mpegts,
        ListenerMode::Cvf,
        ListenerMode::Audio,
        ListenerMode::Audio8,
        ListenerMode::Aaf,
        ListenerMode::FileMpegts,
        ListenerMode::FileAudio,
        ListenerMode::FileAudio8,
        ListenerMode::FileAaf,
        ListenerMode::FileCvf,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ListenerMode::Mpegts => "mpegts",
            ListenerMode::Cvf => "cvf",
            ListenerMode::Audio => "audio",
            ListenerMode::Audio8 => "audio8",
            ListenerMode::Aaf => "aaf",
            ListenerMode::FileMpegts => "filempegts",
            ListenerMode::FileAudio => "fileaudio",
            ListenerMode::FileAudio8 => "fileaudio8",
            ListenerMode::FileAaf => "fileaaf",
            ListenerMode::FileCvf => "filecvf",
        }
    }

    /// Subtype the listener accepts in this mode
    pub fn subtype(&self) -> Subtype {
        match self {
            ListenerMode::Mpegts | ListenerMode::FileMpegts => Subtype::Mpegts61883_4,
            ListenerMode::Cvf | ListenerMode::FileCvf => Subtype::Cvf,
            ListenerMode::Audio
            | ListenerMode::Audio8
            | ListenerMode::FileAudio
            | ListenerMode::FileAudio8 => Subtype::Audio61883_6,
            ListenerMode::Aaf | ListenerMode::FileAaf => Subtype::Aaf,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(
            self,
            ListenerMode::FileMpegts
                | ListenerMode::FileAudio
                | ListenerMode::FileAudio8
                | ListenerMode::FileAaf
                | ListenerMode::FileCvf
        )
    }

    pub fn decimates(&self) -> bool {
        matches!(self, ListenerMode::Audio8 | ListenerMode::FileAudio8)
    }

    /// The first packet's stream id pins the stream when none is configured
    pub fn pins_stream(&self) -> bool {
        self.subtype() == Subtype::Audio61883_6
    }

    /// Output file used when none is configured
    pub fn default_output(&self) -> &'static str {
        match self.subtype() {
            Subtype::Mpegts61883_4 => "recv.ts",
            Subtype::Cvf => "out.h264",
            _ => "out.pcm",
        }
    }
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ListenerMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.name() == lower)
            .ok_or_else(|| {
                let names: Vec<_> = ListenerMode::ALL.iter().map(|m| m.name()).collect();
                format!("unknown mode '{}', expected one of {}", s, names.join("|"))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub interface: String,
    /// Hex stream id; "0" accepts every stream
    pub stream_id: String,
    pub mode: ListenerMode,
    /// Output file for the file modes
    pub output: Option<PathBuf>,
    pub recv_timeout_ms: u64,
    pub scheduling: SchedulingConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".into(),
            stream_id: "0".into(),
            mode: ListenerMode::default(),
            output: None,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT.as_millis() as u64,
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Parsed stream id, `None` when every stream is accepted
    pub fn stream_id(&self) -> Result<Option<u64>> {
        parse_stream_id(&self.stream_id)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.mode.default_output()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkerConfig {
    pub interface: String,
    /// Low 16 bits of the stream id; the MAC fills the upper 48
    pub stream_index: u16,
    pub vlan_priority: u8,
    pub vlan_id: u16,
    pub destination: String,
    pub ts_per_frame: usize,
    pub pacing_us: u64,
    pub scheduling: SchedulingConfig,
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".into(),
            stream_index: 0,
            vlan_priority: DEFAULT_VLAN_PRIORITY,
            vlan_id: DEFAULT_TALKER_VLAN_ID,
            destination: format_mac(&DEFAULT_DEST_ADDR),
            ts_per_frame: DEFAULT_TS_PER_FRAME,
            pacing_us: DEFAULT_PACING.as_micros() as u64,
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl TalkerConfig {
    pub fn destination(&self) -> Result<[u8; 6]> {
        parse_mac(&self.destination)
            .ok_or_else(|| Error::Config(format!("invalid destination MAC '{}'", self.destination)))
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us)
    }
}

/// How much of the recovered clock is applied to hardware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Measure only
    #[default]
    #[serde(rename = "estimate")]
    Estimate,
    /// Write the CRF ratio to the ASRC
    #[serde(rename = "asrc")]
    Asrc,
    /// CRF ratio corrected by gPTP/APE drift
    #[serde(rename = "i2s_master")]
    I2sMaster,
    /// CRF ratio corrected by drift and the ARAD lane ratio
    #[serde(rename = "i2s_slave")]
    I2sSlave,
}

impl ClockMode {
    pub fn name(&self) -> &'static str {
        match self {
            ClockMode::Estimate => "estimate",
            ClockMode::Asrc => "asrc",
            ClockMode::I2sMaster => "i2s_master",
            ClockMode::I2sSlave => "i2s_slave",
        }
    }

    pub fn sets_ratio(&self) -> bool {
        !matches!(self, ClockMode::Estimate)
    }

    pub fn uses_drift(&self) -> bool {
        matches!(self, ClockMode::I2sMaster | ClockMode::I2sSlave)
    }

    pub fn uses_arad(&self) -> bool {
        matches!(self, ClockMode::I2sSlave)
    }
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClockMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "estimate" => Ok(ClockMode::Estimate),
            "asrc" => Ok(ClockMode::Asrc),
            "i2s_master" => Ok(ClockMode::I2sMaster),
            "i2s_slave" => Ok(ClockMode::I2sSlave),
            _ => Err(format!(
                "unknown clock mode '{}', expected estimate|asrc|i2s_master|i2s_slave",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub interface: String,
    /// Measurement window in milliseconds
    pub interval_ms: u64,
    pub nominal_rate: u32,
    pub asrc_stream: u8,
    pub arad_lane: u8,
    pub mode: ClockMode,
    /// Clock driver device node
    pub device: PathBuf,
    /// ALSA card holding the ASRC/ARAD controls
    pub card: String,
    /// Index of "SW" in the ASRC ratio source enumeration
    pub src_sw_index: u32,
    pub settle_secs: u64,
    pub scheduling: SchedulingConfig,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            interface: "eth0.3".into(),
            interval_ms: DEFAULT_WINDOW_INTERVAL.as_millis() as u64,
            nominal_rate: NOMINAL_SAMPLE_RATE,
            asrc_stream: 2,
            arad_lane: 2,
            mode: ClockMode::default(),
            device: PathBuf::from(DRIVER_DEVICE),
            card: "default".into(),
            src_sw_index: 1,
            settle_secs: DEFAULT_SETTLE.as_secs(),
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl ClockConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

impl AppConfig {
    /// Read a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Explicit path if given, else the per-user config file if present,
    /// else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/avb-streamer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "avb-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.listener.stream_id()?;
        if self.listener.recv_timeout_ms == 0 {
            return Err(Error::Config("listener.recv_timeout_ms must be > 0".into()));
        }
        validate_scheduling("listener", &self.listener.scheduling)?;

        self.talker.destination()?;
        if self.talker.ts_per_frame == 0 || self.talker.ts_per_frame > MAX_TS_PER_FRAME {
            return Err(Error::Config(format!(
                "talker.ts_per_frame must be 1..={}, got {}",
                MAX_TS_PER_FRAME, self.talker.ts_per_frame
            )));
        }
        if self.talker.vlan_priority > 7 {
            return Err(Error::Config("talker.vlan_priority must be 0..=7".into()));
        }
        if self.talker.vlan_id > 0x0FFF {
            return Err(Error::Config("talker.vlan_id must be 0..=4095".into()));
        }
        validate_scheduling("talker", &self.talker.scheduling)?;

        let clock = &self.clock;
        if clock.interval_ms == 0 {
            return Err(Error::Config("clock.interval_ms must be > 0".into()));
        }
        if clock.nominal_rate == 0 {
            return Err(Error::Config("clock.nominal_rate must be > 0".into()));
        }
        for (name, value) in [("asrc_stream", clock.asrc_stream), ("arad_lane", clock.arad_lane)] {
            if !(1..=MAX_ASRC_STREAM).contains(&value) {
                return Err(Error::Config(format!(
                    "clock.{} must be 1..={}, got {}",
                    name, MAX_ASRC_STREAM, value
                )));
            }
        }
        validate_scheduling("clock", &clock.scheduling)?;
        Ok(())
    }
}

fn validate_scheduling(section: &str, scheduling: &SchedulingConfig) -> Result<()> {
    if scheduling.policy != SchedPolicy::Other && !(1..=99).contains(&scheduling.priority) {
        return Err(Error::Config(format!(
            "{}.scheduling.priority must be 1..=99 for {:?}",
            section, scheduling.policy
        )));
    }
    Ok(())
}

/// Parse a hex stream id. "0" (or empty) means accept any.
pub fn parse_stream_id(text: &str) -> Result<Option<u64>> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Ok(None);
    }
    let id = u64::from_str_radix(digits, 16)
        .map_err(|_| Error::Config(format!("invalid stream id '{}'", text)))?;
    Ok((id != 0).then_some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.talker.vlan_id, 200);
        assert_eq!(config.talker.ts_per_frame, 7);
        assert_eq!(config.clock.interval(), Duration::from_millis(150));
        assert_eq!(config.listener.stream_id().unwrap(), None);
    }

    #[test]
    fn test_parse_stream_id() {
        assert_eq!(parse_stream_id("0").unwrap(), None);
        assert_eq!(parse_stream_id("").unwrap(), None);
        assert_eq!(
            parse_stream_id("0x0200000000AB0001").unwrap(),
            Some(0x0200_0000_00AB_0001)
        );
        assert_eq!(parse_stream_id("ab0001").unwrap(), Some(0xAB0001));
        assert!(parse_stream_id("xyz").is_err());
    }

    #[test]
    fn test_mode_names() {
        for mode in ListenerMode::ALL {
            assert_eq!(mode.name().parse::<ListenerMode>().unwrap(), mode);
        }
        assert_eq!("FILEAUDIO8".parse::<ListenerMode>().unwrap(), ListenerMode::FileAudio8);
        assert!("video".parse::<ListenerMode>().is_err());
        assert_eq!("i2s-slave".parse::<ClockMode>().unwrap(), ClockMode::I2sSlave);
    }

    #[test]
    fn test_mode_properties() {
        assert!(ListenerMode::FileAudio8.decimates());
        assert!(ListenerMode::FileAudio8.is_file());
        assert!(!ListenerMode::Audio.is_file());
        assert!(ListenerMode::Audio.pins_stream());
        assert!(!ListenerMode::Aaf.pins_stream());
        assert_eq!(ListenerMode::FileMpegts.default_output(), "recv.ts");
        assert_eq!(ListenerMode::FileCvf.default_output(), "out.h264");
        assert!(ClockMode::I2sSlave.uses_arad());
        assert!(!ClockMode::I2sMaster.uses_arad());
        assert!(!ClockMode::Estimate.sets_ratio());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
interface = "eth1"
mode = "fileaudio8"
stream_id = "0x91e0f0000e800001"

[clock]
mode = "i2s_slave"
asrc_stream = 3
scheduling = {{ policy = "fifo", priority = 80 }}
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.listener.interface, "eth1");
        assert_eq!(config.listener.mode, ListenerMode::FileAudio8);
        assert_eq!(config.listener.stream_id().unwrap(), Some(0x91e0_f000_0e80_0001));
        assert_eq!(config.clock.mode, ClockMode::I2sSlave);
        assert_eq!(config.clock.asrc_stream, 3);
        assert_eq!(config.clock.scheduling, SchedulingConfig { policy: SchedPolicy::Fifo, priority: 80 });
        assert_eq!(config.talker.vlan_id, 200);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.clock.asrc_stream = 7;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.talker.ts_per_frame = 8;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.listener.scheduling.policy = SchedPolicy::Fifo;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.talker.destination = "91:e0".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.talker.stream_index = 42;
        config.save(&path).unwrap();

        let loaded = AppConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded.talker.stream_index, 42);
    }
}
