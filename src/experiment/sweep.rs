//! Angular S21 sweep.
//!
//! The sequencer drives one complete antenna pattern measurement:
//!
//! ```text
//! Idle -> PositionToStart -> AcquireBaseline -> StepLoop{1..n} -> Finalize -> Complete
//! ```
//!
//! 1. **PositionToStart**: home the stand rotation, optionally translate the
//!    stand into measurement position, set both polarizations, rotate to the
//!    start angle.
//! 2. **AcquireBaseline**: recall the calibrated instrument state, configure the
//!    channel, reconcile the frequency range with what the analyzer accepts and
//!    capture the reflection baseline.
//! 3. **StepLoop**: at every planned angle read the stand position, trigger,
//!    capture the transmission trace, emit the record (and its -180 twin at
//!    180) and rotate to the next angle.
//! 4. **Finalize**: home the stand, undo the translation, close the output and
//!    record the final positions and frequency settings in the store.
//!
//! Every hardware round trip is awaited before the next begins. Any error
//! aborts the sweep; the caller is responsible for shutting the session down.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::context::SweepContext;
use super::plan::SweepPlan;
use super::polarization::set_polarization;
use crate::config::Settings;
use crate::data::{ResultWriter, SweepRecord};
use crate::error::{AppResult, ChamberError};
use crate::hardware::normalize_angle;
use crate::instrument::{InstrumentFault, VnaSession};
use crate::store::{
    ANTENNA_POLARIZATION, CHAMBER_POLARIZATION, FREQUENCY_START, FREQUENCY_STOP, NUM_STEPS,
};

const CHANNEL: u8 = 1;
const TRACE: u8 = 1;

/// What to do when the analyzer error queue is not empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log every fault and carry on.
    #[default]
    Warn,
    /// Fail the sweep with [`ChamberError::Instrument`].
    Abort,
}

/// Where the sequencer is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepState {
    Idle,
    PositionToStart,
    AcquireBaseline,
    StepLoop { step: usize, of: usize },
    Finalize,
    Complete,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::Idle => write!(f, "idle"),
            SweepState::PositionToStart => write!(f, "positioning to start"),
            SweepState::AcquireBaseline => write!(f, "acquiring baseline"),
            SweepState::StepLoop { step, of } => write!(f, "step {} of {}", step, of),
            SweepState::Finalize => write!(f, "finalizing"),
            SweepState::Complete => write!(f, "complete"),
        }
    }
}

/// Requested sweep, already sanitized.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameters {
    pub frequency_start_hz: f64,
    pub frequency_stop_hz: f64,
    pub points: u32,
    /// Stand angles in degrees.
    pub start: f64,
    pub increment: f64,
    pub stop: f64,
    /// Test antenna polarization in degrees.
    pub tpolar: f64,
    /// Chamber antenna polarization in degrees.
    pub cpolar: f64,
    /// Translate the stand into measurement position first.
    pub translation: bool,
}

/// Tunables that come from configuration rather than the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepOptions {
    pub step_settle: Duration,
    pub error_policy: ErrorPolicy,
    pub stand_offset_deg: f64,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            step_settle: Duration::from_millis(250),
            error_policy: ErrorPolicy::Warn,
            stand_offset_deg: -650.0,
        }
    }
}

impl From<&Settings> for SweepOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            step_settle: settings.sweep.step_settle(),
            error_policy: settings.sweep.error_policy,
            stand_offset_deg: settings.motors.stand_offset_deg,
        }
    }
}

/// Frequency range the analyzer actually accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedRange {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub points: u32,
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub range: AcceptedRange,
    /// Measurement positions visited.
    pub steps: usize,
    /// Rows written, including the synthetic -180 row.
    pub records_written: usize,
    /// Error-queue entries seen under [`ErrorPolicy::Warn`].
    pub faults: Vec<InstrumentFault>,
    pub final_tpolar: f64,
    pub final_cpolar: f64,
}

/// Runs a [`SweepPlan`] against a [`SweepContext`].
pub struct SweepSequencer {
    options: SweepOptions,
    state: SweepState,
    faults: Vec<InstrumentFault>,
}

impl SweepSequencer {
    pub fn new(options: SweepOptions) -> Self {
        Self {
            options,
            state: SweepState::Idle,
            faults: Vec::new(),
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    fn enter(&mut self, state: SweepState) {
        match state {
            SweepState::StepLoop { step, of } => debug!("Sweep step {} of {}", step, of),
            _ => info!("Sweep {}", state),
        }
        self.state = state;
    }

    /// Run the full sweep. `writer` is finished on every exit path.
    pub async fn run(
        &mut self,
        ctx: &mut SweepContext,
        writer: &mut dyn ResultWriter,
        params: &SweepParameters,
    ) -> AppResult<SweepReport> {
        let outcome = self.execute(ctx, writer, params).await;
        if outcome.is_err() {
            if let Err(e) = writer.finish().await {
                warn!("Closing result files also failed: {}", e);
            }
        }
        outcome
    }

    async fn execute(
        &mut self,
        ctx: &mut SweepContext,
        writer: &mut dyn ResultWriter,
        params: &SweepParameters,
    ) -> AppResult<SweepReport> {
        let plan = SweepPlan::new(params.start, params.stop, params.increment)?;
        self.faults.clear();

        self.enter(SweepState::PositionToStart);
        self.position_to_start(ctx, params).await?;

        self.enter(SweepState::AcquireBaseline);
        let range = self.acquire_baseline(ctx, writer, params).await?;

        let records_written = self.step_loop(ctx, writer, &plan).await?;

        self.enter(SweepState::Finalize);
        self.check_errors(&mut ctx.vna, "measuring S21").await?;
        ctx.motors.rotation().goto_zero().await?;
        if params.translation {
            ctx.motors
                .translation()
                .rotate_by_degrees(-self.options.stand_offset_deg)
                .await?;
        }
        writer.finish().await?;

        let final_tpolar = ctx.motors.test_polarization().get_position().await?;
        let final_cpolar = ctx.motors.chamber_polarization().get_position().await?;
        debug!("Updating polarization and frequency settings in the store");
        ctx.store.set_option(ANTENNA_POLARIZATION, final_tpolar).await?;
        ctx.store.set_option(CHAMBER_POLARIZATION, final_cpolar).await?;
        ctx.store.set_option(FREQUENCY_START, range.start_hz / 1e9).await?;
        ctx.store.set_option(FREQUENCY_STOP, range.stop_hz / 1e9).await?;
        ctx.store.set_option(NUM_STEPS, f64::from(range.points)).await?;
        ctx.store.commit().await?;

        self.enter(SweepState::Complete);
        Ok(SweepReport {
            range,
            steps: plan.len(),
            records_written,
            faults: self.faults.clone(),
            final_tpolar,
            final_cpolar,
        })
    }

    async fn position_to_start(&mut self, ctx: &mut SweepContext, params: &SweepParameters) -> AppResult<()> {
        ctx.motors.rotation().goto_zero().await?;
        if params.translation {
            ctx.motors
                .translation()
                .rotate_by_degrees(self.options.stand_offset_deg)
                .await?;
        }
        set_polarization(&ctx.motors, ctx.store.as_ref(), params.tpolar, params.cpolar).await?;

        info!("Start position: {}", params.start);
        ctx.motors.rotation().rotate_by_degrees(params.start).await?;
        info!("Motor setup complete");
        Ok(())
    }

    async fn acquire_baseline(
        &mut self,
        ctx: &mut SweepContext,
        writer: &mut dyn ResultWriter,
        params: &SweepParameters,
    ) -> AppResult<AcceptedRange> {
        ctx.vna.load_state().await?;
        let setup_faults = ctx.vna.setup(CHANNEL, TRACE).await?;
        self.absorb(setup_faults, "configuring the network analyzer channel")?;
        let range = reconcile_range(
            &mut ctx.vna,
            params.frequency_start_hz,
            params.frequency_stop_hz,
            params.points,
        )
        .await?;
        self.check_errors(&mut ctx.vna, "setting network analyzer parameters")
            .await?;

        // Reflection baseline is taken on port 2
        info!("Measuring S11");
        ctx.vna.set_measurement(CHANNEL, TRACE, 2, 2).await?;
        let (frequencies, data) = acquire_trace(&mut ctx.vna, true).await?;
        debug!("Writing S11 data");
        writer.write_baseline(&frequencies, &data).await?;
        self.check_errors(&mut ctx.vna, "measuring S11").await?;

        Ok(range)
    }

    async fn step_loop(
        &mut self,
        ctx: &mut SweepContext,
        writer: &mut dyn ResultWriter,
        plan: &SweepPlan,
    ) -> AppResult<usize> {
        debug!("Number of angle steps: {}", plan.len());
        ctx.vna.set_measurement(CHANNEL, TRACE, 2, 1).await?;
        info!("Measuring S21");

        let half_step = ctx.motors.rotation().model().step_increment() / 2.0;
        let mut frequencies = Vec::new();
        let mut written = 0;

        for step in plan.steps() {
            self.enter(SweepState::StepLoop {
                step: step.index,
                of: plan.len(),
            });

            let position = snap_position(ctx.motors.rotation().get_position().await?);
            let first = step.index == 1;
            let (axis, response) = acquire_trace(&mut ctx.vna, first).await?;
            if first {
                frequencies = axis;
                writer.write_sweep_header(&frequencies).await?;
            }

            let record = SweepRecord {
                angle_degrees: normalize_angle(position),
                frequencies: frequencies.clone(),
                response,
            };
            writer.write_record(&record).await?;
            written += 1;
            if (position - 180.0).abs() < half_step {
                writer.write_record(&record.at_angle(-180.0)).await?;
                written += 1;
            }

            debug!(
                "Step {}. Current angle {:.2}. Rotate {:.2} degrees",
                step.index, position, step.rotation_delta
            );
            ctx.motors
                .rotation()
                .rotate_by_degrees(step.rotation_delta)
                .await?;
            sleep(self.options.step_settle).await;
        }

        Ok(written)
    }

    async fn check_errors(&mut self, vna: &mut VnaSession, during: &str) -> AppResult<()> {
        let faults = check_error_queue(vna, self.options.error_policy, during).await?;
        self.faults.extend(faults);
        Ok(())
    }

    fn absorb(&mut self, faults: Vec<InstrumentFault>, during: &str) -> AppResult<()> {
        let faults = apply_error_policy(faults, self.options.error_policy, during)?;
        self.faults.extend(faults);
        Ok(())
    }
}

/// Drain the analyzer error queue and apply `policy` to what was found.
pub async fn check_error_queue(
    vna: &mut VnaSession,
    policy: ErrorPolicy,
    during: &str,
) -> AppResult<Vec<InstrumentFault>> {
    debug!("Checking network analyzer error queue");
    let faults = vna.get_errors().await?;
    if faults.is_empty() {
        debug!("No network analyzer errors detected");
    }
    apply_error_policy(faults, policy, during)
}

/// Judge faults that were already drained from the queue.
pub fn apply_error_policy(
    faults: Vec<InstrumentFault>,
    policy: ErrorPolicy,
    during: &str,
) -> AppResult<Vec<InstrumentFault>> {
    if faults.is_empty() {
        return Ok(faults);
    }

    warn!("Error in {}", during);
    if policy == ErrorPolicy::Abort {
        let list = faults
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ChamberError::Instrument(format!("{} while {}", list, during)));
    }
    Ok(faults)
}

/// Apply start/stop/points and return what the analyzer accepted, warning on
/// every adjusted value.
pub async fn reconcile_range(
    vna: &mut VnaSession,
    start_hz: f64,
    stop_hz: f64,
    points: u32,
) -> AppResult<AcceptedRange> {
    let accepted_start = vna.set_start(CHANNEL, start_hz).await?;
    if accepted_start != start_hz {
        warn!("Invalid start frequency, using {}", accepted_start);
    }
    let accepted_stop = vna.set_stop(CHANNEL, stop_hz).await?;
    if accepted_stop != stop_hz {
        warn!("Invalid stop frequency, using {}", accepted_stop);
    }
    let accepted_points = vna.set_points(CHANNEL, points).await?;
    if accepted_points != points {
        warn!("Invalid number of frequency steps, using {}", accepted_points);
    }

    Ok(AcceptedRange {
        start_hz: accepted_start,
        stop_hz: accepted_stop,
        points: accepted_points,
    })
}

/// Trigger one sweep and read the corrected trace, plus the frequency axis
/// when `with_axis` is set.
pub(super) async fn acquire_trace(
    vna: &mut VnaSession,
    with_axis: bool,
) -> AppResult<(Vec<f64>, Vec<num_complex::Complex64>)> {
    vna.trigger().await?;
    vna.update_display().await?;
    vna.auto_scale(CHANNEL, TRACE).await?;
    let frequencies = if with_axis {
        vna.get_x(CHANNEL).await?
    } else {
        Vec::new()
    };
    let data = vna.get_corrected_data(CHANNEL).await?;
    Ok((frequencies, data))
}

/// Positions are step multiples; drop the float noise of the conversion.
fn snap_position(degrees: f64) -> f64 {
    (degrees * 1e6).round() / 1e6
}
