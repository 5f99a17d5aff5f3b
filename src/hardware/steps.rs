//! Angle/step conversion for the two stepper models on the chamber.
//!
//! The controller counts indices in the opposite direction to the angle
//! convention used everywhere else, so both conversions invert the sign.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ChamberError};

/// Largest step count representable in a relative-move command (24 bits).
pub const MAX_STEPS: i64 = 16_777_215;

/// Stepper motor model driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorModel {
    /// 0.01 degrees per step, 4 degrees per turn.
    B5990,
    /// 0.025 degrees per step, 10 degrees per turn.
    B4836,
}

impl MotorModel {
    /// Degrees of rotation per motor step.
    pub const fn step_increment(self) -> f64 {
        match self {
            MotorModel::B5990 => 0.01,
            MotorModel::B4836 => 0.025,
        }
    }

    /// Degrees of rotation per full motor turn.
    pub const fn advance_per_turn(self) -> f64 {
        match self {
            MotorModel::B5990 => 4.0,
            MotorModel::B4836 => 10.0,
        }
    }

    /// Catalogue name of the motor.
    pub const fn name(self) -> &'static str {
        match self {
            MotorModel::B5990 => "B5990",
            MotorModel::B4836 => "B4836",
        }
    }
}

impl fmt::Display for MotorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} deg/step, {} deg/turn)",
            self.name(),
            self.step_increment(),
            self.advance_per_turn()
        )
    }
}

/// Convert a rotation in degrees into a controller step count.
///
/// Rounds half to even. Fails with `Validation` when the magnitude exceeds
/// [`MAX_STEPS`] or the input is not finite.
pub fn to_steps(degrees: f64, model: MotorModel) -> AppResult<i64> {
    if !degrees.is_finite() {
        return Err(ChamberError::Validation(format!(
            "cannot convert {} degrees to steps",
            degrees
        )));
    }

    let steps = (-degrees / model.step_increment()).round_ties_even();
    if steps.abs() > MAX_STEPS as f64 {
        return Err(ChamberError::Validation(format!(
            "{} degrees is {} steps on a {}, limit is {}",
            degrees,
            steps,
            model.name(),
            MAX_STEPS
        )));
    }

    // round_ties_even of a negative fraction can yield -0.0
    Ok(steps as i64)
}

/// Convert a controller index back into degrees.
pub fn to_degrees(steps: i64, model: MotorModel) -> f64 {
    steps as f64 * -model.step_increment()
}

/// Map positions above 180 degrees into the negative half-circle.
pub fn normalize_angle(position: f64) -> f64 {
    if position > 180.0 {
        position - 360.0
    } else {
        position
    }
}
