//! Command-line parameter sanitation.
//!
//! Out-of-range values are clamped with a warning rather than rejected so an
//! operator typo does not cost a chamber setup. Only non-finite input fails.

use tracing::warn;

use super::gain::GainParameters;
use super::sweep::SweepParameters;
use crate::error::{AppResult, ChamberError};

fn finite(name: &str, value: f64) -> AppResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ChamberError::Validation(format!(
            "{} must be a finite number, got {}",
            name, value
        )))
    }
}

fn at_least(name: &str, value: f64, min: f64) -> f64 {
    if value < min {
        warn!("{} must be at least {}. Using {}", name, min, min);
        min
    } else {
        value
    }
}

fn at_most(name: &str, value: f64, max: f64) -> f64 {
    if value > max {
        warn!("{} must be at most {}. Using {}", name, max, max);
        max
    } else {
        value
    }
}

fn clamp(name: &str, value: f64, min: f64, max: f64) -> f64 {
    at_most(name, at_least(name, value, min), max)
}

/// Clamp both polarizations into [0, 180].
pub fn sanitize_polarization(tpolar: f64, cpolar: f64) -> AppResult<(f64, f64)> {
    let tpolar = finite("Test antenna polarization", tpolar)?;
    let cpolar = finite("Chamber antenna polarization", cpolar)?;
    Ok((
        clamp("Test antenna polarization", tpolar, 0.0, 180.0),
        clamp("Chamber antenna polarization", cpolar, 0.0, 180.0),
    ))
}

/// Clamp the stand angles and polarizations into their valid ranges.
///
/// Start is held to [0, 360], the increment to [1, 180] and stop to
/// [start, 360]. Frequencies and points pass through; the analyzer reports
/// what it accepts.
pub fn sanitize(params: SweepParameters) -> AppResult<SweepParameters> {
    let start = finite("Start angle", params.start)?;
    let increment = finite("Angle increment", params.increment)?;
    let stop = finite("Stop angle", params.stop)?;
    finite("Start frequency", params.frequency_start_hz)?;
    finite("Stop frequency", params.frequency_stop_hz)?;

    let start = clamp("Start angle", start, 0.0, 360.0);
    let increment = clamp("Angle increment", increment, 1.0, 180.0);
    let stop = at_least("Stop angle", at_most("Stop angle", stop, 360.0), start);
    let (tpolar, cpolar) = sanitize_polarization(params.tpolar, params.cpolar)?;

    Ok(SweepParameters {
        start,
        increment,
        stop,
        tpolar,
        cpolar,
        ..params
    })
}

/// Clamp the measurement angle into [0, 360] and both polarizations into
/// [0, 180].
pub fn sanitize_gain(params: GainParameters) -> AppResult<GainParameters> {
    let angle = finite("Start angle", params.angle)?;
    finite("Start frequency", params.frequency_start_hz)?;
    finite("Stop frequency", params.frequency_stop_hz)?;
    let (tpolar, cpolar) = sanitize_polarization(params.tpolar, params.cpolar)?;

    Ok(GainParameters {
        angle: clamp("Start angle", angle, 0.0, 360.0),
        tpolar,
        cpolar,
        ..params
    })
}
