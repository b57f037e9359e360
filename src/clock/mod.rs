//! Media clock recovery from CRF streams

pub mod hardware;
pub mod rate;
pub mod recovery;

#[cfg(all(target_os = "linux", feature = "alsa"))]
pub use hardware::AlsaControls;
#[cfg(target_os = "linux")]
pub use hardware::ApeDriver;
pub use hardware::{ClockHardware, ControlMap, ControlSurface, Drift, NullHardware};
pub use rate::{compute_rate_info, RateInfo, RateRatio};
pub use recovery::{
    estimate_frequency, monotonic_ns, run_recovery, ClockRecovery, Diagnostics,
    FrequencyEstimate, RecoveryOptions, RecoveryState, WindowReport,
};
