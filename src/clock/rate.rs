//! Fixed-point ratio and rate/period conversions for the clock hardware

use serde::Serialize;

use crate::error::ClockError;

/// One in the 32-bit fractional format
const FRACTION_ONE: f64 = 4_294_967_296.0;

/// Scale used by the rate/period search
const CALC_BASE: i128 = 1_000_000_000_000;

/// Exclusive upper bound of the period modulo register
pub const MAX_MODULO: u32 = 65_536;

/// Integer + 32-bit fraction, as written to the ASRC/ARAD ratio controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateRatio {
    integer: u32,
    fractional: u32,
}

impl RateRatio {
    pub const UNITY: RateRatio = RateRatio {
        integer: 1,
        fractional: 0,
    };

    /// `integer = floor(ratio)`, `fractional = round(frac * 2^32)`, the
    /// fraction saturating at `u32::MAX`
    pub fn from_ratio(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() { ratio.max(0.0) } else { 0.0 };
        let whole = ratio.floor();
        let fraction = ((ratio - whole) * FRACTION_ONE).round();
        Self {
            integer: if whole >= u32::MAX as f64 { u32::MAX } else { whole as u32 },
            fractional: if fraction >= FRACTION_ONE { u32::MAX } else { fraction as u32 },
        }
    }

    /// Ratio read back from a pair of hardware controls
    pub fn from_parts(integer: u32, fractional: u32) -> Self {
        Self { integer, fractional }
    }

    pub fn integer_part(&self) -> u32 {
        self.integer
    }

    pub fn fractional_part(&self) -> u32 {
        self.fractional
    }

    pub fn as_f64(&self) -> f64 {
        self.integer as f64 + self.fractional as f64 / FRACTION_ONE
    }
}

/// Rate-to-period register set (`struct rate_to_time_period` in the driver)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateInfo {
    pub rate: u32,
    pub n_int: u32,
    pub n_fract: u32,
    pub n_modulo: u32,
}

impl RateInfo {
    /// Period the registers describe, in the same unit as the search period
    pub fn period(&self) -> f64 {
        if self.n_modulo == 0 {
            return self.n_int as f64;
        }
        self.n_int as f64 + self.n_fract as f64 / self.n_modulo as f64
    }
}

/// Express `period / rate` as `n_int + n_fract / n_modulo` with
/// `n_modulo < 65536`.
///
/// Searches every modulo in order for the numerator closest to the
/// fractional remainder (scaled by 10^12). An exact match stops the search;
/// otherwise the first modulo reaching the minimum error wins.
pub fn compute_rate_info(rate: u32, period: u64) -> Result<RateInfo, ClockError> {
    if rate == 0 {
        return Err(ClockError::InvalidRate(rate));
    }

    let exact = period as f64 / rate as f64;
    let n_int = exact.trunc();
    let scaled = (exact - n_int) * CALC_BASE as f64;
    let target = scaled as i128;
    let frac_target = ((scaled - target as f64) * 100.0) as i128;
    let half = CALC_BASE / 2;

    let mut best = (0i128, 1i128);
    let mut best_diff = i128::MAX;
    for modulo in 1..MAX_MODULO as i128 {
        let n = (target * modulo + half) / CALC_BASE;
        let estimate = n * CALC_BASE * 100 / modulo;
        let diff = (target * 100 - estimate).abs();
        if diff == frac_target {
            tracing::debug!("Exact rate fraction {}/{}", n, modulo);
            best = (n, modulo);
            break;
        }
        if diff < best_diff {
            best_diff = diff;
            best = (n, modulo);
        }
    }

    let info = RateInfo {
        rate,
        n_int: n_int as u32,
        n_fract: best.0 as u32,
        n_modulo: best.1 as u32,
    };
    tracing::info!(
        "rate: {} int: {} frac: {} modulo: {}",
        info.rate,
        info.n_int,
        info.n_fract,
        info.n_modulo
    );
    Ok(info)
}
