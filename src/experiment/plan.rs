//! Angular step plan for a stand sweep.
//!
//! A plan visits `start, start + inc, ...` and its rotation deltas always sum
//! to `stop - start`: every step moves by the increment except the last, which
//! absorbs the fractional remainder. A full 0..360 circle stops one step short
//! so 360 (which is 0 again) is not measured twice.

use crate::error::{AppResult, ChamberError};

/// Upper bound on positions in one plan.
pub const MAX_PLAN_STEPS: usize = 100_000;

/// One measurement position and the rotation that follows it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepStep {
    /// 1-based step number.
    pub index: usize,
    /// Angle the stand is expected to be at when measuring.
    pub commanded_angle: f64,
    /// Rotation applied after measuring.
    pub rotation_delta: f64,
}

/// Validated list of rotation steps for one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    start: f64,
    stop: f64,
    increment: f64,
    steps: Vec<SweepStep>,
}

impl SweepPlan {
    pub fn new(start: f64, stop: f64, increment: f64) -> AppResult<Self> {
        if !(start.is_finite() && stop.is_finite() && increment.is_finite()) {
            return Err(ChamberError::Validation(
                "sweep bounds must be finite".to_string(),
            ));
        }
        if increment <= 0.0 {
            return Err(ChamberError::Validation(format!(
                "sweep increment must be positive, got {}",
                increment
            )));
        }
        if stop < start {
            return Err(ChamberError::Validation(format!(
                "sweep stop {} is before start {}",
                stop, start
            )));
        }

        let count = step_count(start, stop, increment)?;
        let steps = (1..=count)
            .map(|k| {
                let rotation_delta = if k < count {
                    increment
                } else {
                    stop - start - (count - 1) as f64 * increment
                };
                SweepStep {
                    index: k,
                    commanded_angle: start + (k - 1) as f64 * increment,
                    rotation_delta,
                }
            })
            .collect();

        Ok(Self {
            start,
            stop,
            increment,
            steps,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }

    pub fn steps(&self) -> &[SweepStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of every rotation delta.
    pub fn total_rotation(&self) -> f64 {
        self.steps.iter().map(|s| s.rotation_delta).sum()
    }
}

/// Number of measurement positions, at most [`MAX_PLAN_STEPS`].
pub fn step_count(start: f64, stop: f64, increment: f64) -> AppResult<usize> {
    let too_many = || {
        ChamberError::Validation(format!(
            "sweep {} to {} by {} exceeds {} positions",
            start, stop, increment, MAX_PLAN_STEPS
        ))
    };

    let intervals = ((stop - start) / increment).floor();
    if !intervals.is_finite() || intervals >= MAX_PLAN_STEPS as f64 {
        return Err(too_many());
    }
    let count = (intervals as usize).checked_add(1).ok_or_else(too_many)?;
    if start == 0.0 && stop == 360.0 {
        Ok(count - 1)
    } else {
        Ok(count)
    }
}
