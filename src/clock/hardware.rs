//! Hardware access for clock recovery
//!
//! Two seams: [`ClockHardware`] is the APE clock driver (rate registers and
//! gPTP/APE drift), [`ControlSurface`] is the set of named mixer controls that
//! hold the ASRC and ARAD ratios.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::clock::rate::RateInfo;
use crate::error::ClockError;

/// Drift between the gPTP clock and the local audio clock
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub drift_num: u64,
    pub drift_den: u64,
}

impl Drift {
    /// `num / den`, or `None` when the driver has not measured anything yet
    pub fn ratio(&self) -> Option<f64> {
        if self.drift_den == 0 || self.drift_num == 0 {
            return None;
        }
        Some(self.drift_num as f64 / self.drift_den as f64)
    }
}

/// Audio clock driver commands
pub trait ClockHardware: Send {
    fn get_rate(&mut self) -> Result<RateInfo, ClockError>;

    fn init(&mut self, rate: &RateInfo) -> Result<(), ClockError>;

    fn deinit(&mut self) -> Result<(), ClockError>;

    /// Latch and return the frequency drift since the previous call
    fn freq_sync(&mut self) -> Result<Drift, ClockError>;

    fn phase_sync(&mut self) -> Result<Drift, ClockError>;
}

/// Named integer/enumerated controls
///
/// Values are 64-bit so 32-bit unsigned fractions survive the round trip.
pub trait ControlSurface: Send {
    fn set_integer(&mut self, name: &str, value: i64) -> Result<(), ClockError>;

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError>;

    fn set_enumerated(&mut self, name: &str, index: u32) -> Result<(), ClockError>;
}

impl<T: ControlSurface + ?Sized> ControlSurface for Box<T> {
    fn set_integer(&mut self, name: &str, value: i64) -> Result<(), ClockError> {
        (**self).set_integer(name, value)
    }

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError> {
        (**self).get_integer(name)
    }

    fn set_enumerated(&mut self, name: &str, index: u32) -> Result<(), ClockError> {
        (**self).set_enumerated(name, index)
    }
}

pub fn asrc_ratio_int(stream: u8) -> String {
    format!("ASRC1 Ratio{} Int", stream)
}

pub fn asrc_ratio_frac(stream: u8) -> String {
    format!("ASRC1 Ratio{} Frac", stream)
}

pub fn asrc_ratio_src(stream: u8) -> String {
    format!("ASRC1 Ratio{} SRC", stream)
}

pub fn arad_ratio_int(lane: u8) -> String {
    format!("Lane{} Ratio Int", lane)
}

pub fn arad_ratio_frac(lane: u8) -> String {
    format!("Lane{} Ratio Frac", lane)
}

#[cfg(target_os = "linux")]
mod ioctl {
    use super::Drift;
    use crate::clock::rate::RateInfo;

    const APE_MAGIC: u8 = 0xF9;

    // The driver declares every command with _IO() but still passes a pointer
    nix::ioctl_write_ptr_bad!(
        ape_init,
        nix::request_code_none!(APE_MAGIC, 0x01),
        RateInfo
    );
    nix::ioctl_none!(ape_deinit, APE_MAGIC, 0x02);
    nix::ioctl_read_bad!(
        ape_freq_sync,
        nix::request_code_none!(APE_MAGIC, 0x03),
        Drift
    );
    nix::ioctl_read_bad!(
        ape_phase_sync,
        nix::request_code_none!(APE_MAGIC, 0x04),
        Drift
    );
    nix::ioctl_read_bad!(
        ape_get_rate,
        nix::request_code_none!(APE_MAGIC, 0x06),
        RateInfo
    );
}

/// Character device of the APE clock driver
#[cfg(target_os = "linux")]
pub struct ApeDriver {
    file: std::fs::File,
    path: PathBuf,
}

#[cfg(target_os = "linux")]
impl ApeDriver {
    pub fn open(path: &Path) -> Result<Self, ClockError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ClockError::DriverCommandFailed {
                command: "OPEN",
                source,
            })?;
        tracing::info!("Opened clock driver {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }
}

#[cfg(target_os = "linux")]
fn driver_error(command: &'static str) -> impl FnOnce(nix::errno::Errno) -> ClockError {
    move |errno| ClockError::DriverCommandFailed {
        command,
        source: std::io::Error::from(errno),
    }
}

#[cfg(target_os = "linux")]
impl ClockHardware for ApeDriver {
    fn get_rate(&mut self) -> Result<RateInfo, ClockError> {
        let mut info = RateInfo::default();
        // SAFETY: `info` is a live repr(C) value matching the driver's struct.
        unsafe { ioctl::ape_get_rate(self.fd(), &mut info) }.map_err(driver_error("GET_RATE"))?;
        tracing::debug!("Driver rate {}", info.rate);
        Ok(info)
    }

    fn init(&mut self, rate: &RateInfo) -> Result<(), ClockError> {
        // SAFETY: the driver only reads from the pointed-to RateInfo.
        unsafe { ioctl::ape_init(self.fd(), rate) }.map_err(driver_error("INIT"))?;
        tracing::info!("Clock driver initialised at {} Hz", rate.rate);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), ClockError> {
        // SAFETY: command takes no argument.
        unsafe { ioctl::ape_deinit(self.fd()) }.map_err(driver_error("DEINIT"))?;
        Ok(())
    }

    fn freq_sync(&mut self) -> Result<Drift, ClockError> {
        let mut drift = Drift::default();
        // SAFETY: `drift` is a live repr(C) value matching the driver's struct.
        unsafe { ioctl::ape_freq_sync(self.fd(), &mut drift) }
            .map_err(driver_error("FREQ_SYNC"))?;
        Ok(drift)
    }

    fn phase_sync(&mut self) -> Result<Drift, ClockError> {
        let mut drift = Drift::default();
        // SAFETY: as for freq_sync.
        unsafe { ioctl::ape_phase_sync(self.fd(), &mut drift) }
            .map_err(driver_error("PHASE_SYNC"))?;
        Ok(drift)
    }
}

/// Mixer controls of one ALSA card
#[cfg(all(target_os = "linux", feature = "alsa"))]
pub struct AlsaControls {
    hctl: alsa::hctl::HCtl,
    card: String,
}

#[cfg(all(target_os = "linux", feature = "alsa"))]
impl AlsaControls {
    pub fn open(card: &str) -> Result<Self, ClockError> {
        let hctl = alsa::hctl::HCtl::new(card, false)
            .map_err(|e| ClockError::HardwareControlUnavailable(format!("{}: {}", card, e)))?;
        hctl.load()
            .map_err(|e| ClockError::HardwareControlUnavailable(format!("{}: {}", card, e)))?;
        tracing::info!("Opened mixer controls of card {}", card);
        Ok(Self {
            hctl,
            card: card.to_string(),
        })
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    fn find(&self, name: &str) -> Result<alsa::hctl::Elem<'_>, ClockError> {
        let unavailable = || ClockError::HardwareControlUnavailable(name.to_string());
        let cname = std::ffi::CString::new(name).map_err(|_| unavailable())?;
        let mut id = alsa::ctl::ElemId::new(alsa::ctl::ElemIface::Mixer);
        id.set_name(&cname);
        self.hctl.find_elem(&id).ok_or_else(unavailable)
    }

    fn is_integer64(elem: &alsa::hctl::Elem<'_>) -> bool {
        matches!(
            elem.info().map(|info| info.get_type()),
            Ok(alsa::ctl::ElemType::Integer64)
        )
    }
}

#[cfg(all(target_os = "linux", feature = "alsa"))]
impl ControlSurface for AlsaControls {
    fn set_integer(&mut self, name: &str, value: i64) -> Result<(), ClockError> {
        let unavailable = || ClockError::HardwareControlUnavailable(name.to_string());
        let elem = self.find(name)?;
        let mut elem_value = elem.read().map_err(|_| unavailable())?;
        let stored = if Self::is_integer64(&elem) {
            elem_value.set_integer64(0, value)
        } else {
            // 32-bit controls carry unsigned fractions as raw bits
            elem_value.set_integer(0, value as u32 as i32)
        };
        stored.ok_or_else(unavailable)?;
        elem.write(&elem_value).map_err(|_| unavailable())?;
        Ok(())
    }

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError> {
        let unavailable = || ClockError::HardwareControlUnavailable(name.to_string());
        let elem = self.find(name)?;
        let elem_value = elem.read().map_err(|_| unavailable())?;
        let value = if Self::is_integer64(&elem) {
            elem_value.get_integer64(0)
        } else {
            elem_value.get_integer(0).map(|v| v as u32 as i64)
        };
        value.ok_or_else(unavailable)
    }

    fn set_enumerated(&mut self, name: &str, index: u32) -> Result<(), ClockError> {
        let unavailable = || ClockError::HardwareControlUnavailable(name.to_string());
        let elem = self.find(name)?;
        let mut elem_value = elem.read().map_err(|_| unavailable())?;
        elem_value.set_enumerated(0, index).ok_or_else(unavailable)?;
        elem.write(&elem_value).map_err(|_| unavailable())?;
        Ok(())
    }
}

/// Stand-in when no driver or mixer is present: reports the nominal rate,
/// unity drift, and no controls
#[derive(Debug, Clone)]
pub struct NullHardware {
    rate: u32,
}

impl NullHardware {
    pub fn new(rate: u32) -> Self {
        Self { rate }
    }
}

impl ClockHardware for NullHardware {
    fn get_rate(&mut self) -> Result<RateInfo, ClockError> {
        Ok(RateInfo {
            rate: self.rate,
            ..RateInfo::default()
        })
    }

    fn init(&mut self, _rate: &RateInfo) -> Result<(), ClockError> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), ClockError> {
        Ok(())
    }

    fn freq_sync(&mut self) -> Result<Drift, ClockError> {
        Ok(Drift {
            drift_num: 1,
            drift_den: 1,
        })
    }

    fn phase_sync(&mut self) -> Result<Drift, ClockError> {
        self.freq_sync()
    }
}

impl ControlSurface for NullHardware {
    fn set_integer(&mut self, name: &str, _value: i64) -> Result<(), ClockError> {
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError> {
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }

    fn set_enumerated(&mut self, name: &str, _index: u32) -> Result<(), ClockError> {
        Err(ClockError::HardwareControlUnavailable(name.to_string()))
    }
}

/// In-memory control table; names that were never defined are unavailable
#[derive(Debug, Clone, Default)]
pub struct ControlMap {
    values: HashMap<String, i64>,
    writes: Vec<(String, i64)>,
}

impl ControlMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or overwrite) a control
    pub fn define(&mut self, name: &str, value: i64) -> &mut Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn value(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    /// Every successful write, oldest first
    pub fn writes(&self) -> &[(String, i64)] {
        &self.writes
    }
}

impl ControlSurface for ControlMap {
    fn set_integer(&mut self, name: &str, value: i64) -> Result<(), ClockError> {
        let slot = self
            .values
            .get_mut(name)
            .ok_or_else(|| ClockError::HardwareControlUnavailable(name.to_string()))?;
        *slot = value;
        self.writes.push((name.to_string(), value));
        Ok(())
    }

    fn get_integer(&mut self, name: &str) -> Result<i64, ClockError> {
        self.value(name)
            .ok_or_else(|| ClockError::HardwareControlUnavailable(name.to_string()))
    }

    fn set_enumerated(&mut self, name: &str, index: u32) -> Result<(), ClockError> {
        self.set_integer(name, index as i64)
    }
}
