//! Chamber procedures.
//!
//! Each procedure borrows a [`SweepContext`] and runs strictly sequentially:
//!
//! - [`sweep`]: the angular S21 pattern measurement ([`SweepSequencer`]).
//! - [`polarization`]: move the antenna polarizations and record them.
//! - [`alignment`]: interactive jog-and-zero of individual motors.
//! - [`gain`]: one S21 trace at a single stand angle.
//! - [`calibration`]: one-port electronic calibration of the analyzer and the
//!   S21 reference trace.
//!
//! # Example
//!
//! ```rust,ignore
//! use chamber_daq::experiment::{SweepSequencer, SweepOptions};
//!
//! let mut sequencer = SweepSequencer::new(SweepOptions::from(&settings));
//! let report = sequencer.run(&mut ctx, &mut writer, &params).await;
//! ctx.finish(report).await?;
//! ```

pub mod alignment;
pub mod calibration;
pub mod context;
pub mod gain;
pub mod params;
pub mod plan;
pub mod polarization;
pub mod sweep;

pub use alignment::{run_alignment, run_motor_alignment, InputResult};
pub use calibration::{run_s11_calibration, run_s21_calibration, CalibrationReport};
pub use context::SweepContext;
pub use gain::{run_gain_measurement, GainParameters, GainReport};
pub use params::{sanitize, sanitize_gain, sanitize_polarization};
pub use plan::{SweepPlan, SweepStep};
pub use polarization::{run_polarization_rotation, set_polarization};
pub use sweep::{ErrorPolicy, SweepOptions, SweepParameters, SweepReport, SweepSequencer, SweepState};
