//! Captured sweep data and the writers that persist it.

use num_complex::Complex64;

pub mod format;
pub mod storage;

pub use storage::{
    CsvResultWriter, CsvTraceWriter, MemoryResultWriter, MemoryTraceWriter, ResultWriter,
    TraceWriter, GAIN_TRACE_FILE, S21_CALIBRATION_FILE,
};

/// One angle-indexed row of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    /// Stand angle, wrapped into (-180, 180] (plus the synthetic -180 row).
    pub angle_degrees: f64,
    /// Frequency axis in Hz.
    pub frequencies: Vec<f64>,
    /// Corrected response at each frequency.
    pub response: Vec<Complex64>,
}

impl SweepRecord {
    /// Same trace at another angle.
    pub fn at_angle(&self, angle_degrees: f64) -> Self {
        Self {
            angle_degrees,
            ..self.clone()
        }
    }
}
