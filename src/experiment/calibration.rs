//! Network analyzer calibration procedures.
//!
//! [`run_s11_calibration`] configures the channel, reconciles the frequency
//! range, runs the e-cal on port 2, then stores and recalls the instrument
//! state so later sweeps (which start with a state recall) use the new
//! correction.
//!
//! [`run_s21_calibration`] captures a reference transmission trace through the
//! calibrated state. No motor moves.

use tracing::info;

use super::context::SweepContext;
use super::sweep::{
    apply_error_policy, check_error_queue, reconcile_range, AcceptedRange, ErrorPolicy,
};
use crate::data::TraceWriter;
use crate::error::AppResult;
use crate::instrument::InstrumentFault;
use crate::store::{FREQUENCY_START, FREQUENCY_STOP, NUM_STEPS};

const CHANNEL: u8 = 1;
const TRACE: u8 = 1;
const CALIBRATION_PORT: u8 = 2;

/// Range the analyzer accepted and any faults seen while calibrating.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub range: AcceptedRange,
    pub faults: Vec<InstrumentFault>,
}

pub async fn run_s11_calibration(
    ctx: &mut SweepContext,
    start_hz: f64,
    stop_hz: f64,
    points: u32,
    policy: ErrorPolicy,
) -> AppResult<CalibrationReport> {
    info!("Setting parameters");
    let mut faults = apply_error_policy(
        ctx.vna.setup(CHANNEL, TRACE).await?,
        policy,
        "configuring the network analyzer channel",
    )?;
    let range = reconcile_range(&mut ctx.vna, start_hz, stop_hz, points).await?;

    info!("Updating frequency settings in the store");
    ctx.store.set_option(FREQUENCY_START, range.start_hz / 1e9).await?;
    ctx.store.set_option(FREQUENCY_STOP, range.stop_hz / 1e9).await?;
    ctx.store.set_option(NUM_STEPS, f64::from(range.points)).await?;
    ctx.store.commit().await?;

    faults.extend(
        check_error_queue(&mut ctx.vna, policy, "setting network analyzer parameters").await?,
    );

    info!(
        "Starting S11 calibration: {} GHz to {} GHz, {} points",
        range.start_hz / 1e9,
        range.stop_hz / 1e9,
        range.points
    );
    ctx.vna.calibrate_s11(CHANNEL, CALIBRATION_PORT).await?;
    ctx.vna.save_state().await?;
    ctx.vna.load_state().await?;
    ctx.vna.set_data_correction(CHANNEL, true).await?;

    let calibration_faults =
        check_error_queue(&mut ctx.vna, policy, "calibrating network analyzer S11").await?;
    if calibration_faults.is_empty() {
        info!("S11 calibration successful");
    }
    faults.extend(calibration_faults);

    Ok(CalibrationReport { range, faults })
}

/// Record the S21 reference trace for the requested range.
pub async fn run_s21_calibration(
    ctx: &mut SweepContext,
    writer: &mut dyn TraceWriter,
    start_hz: f64,
    stop_hz: f64,
    points: u32,
    policy: ErrorPolicy,
) -> AppResult<CalibrationReport> {
    ctx.vna.load_state().await?;
    info!("Setting parameters");
    let mut faults = apply_error_policy(
        ctx.vna.setup(CHANNEL, TRACE).await?,
        policy,
        "configuring the network analyzer channel",
    )?;
    let range = reconcile_range(&mut ctx.vna, start_hz, stop_hz, points).await?;

    info!("Updating frequency settings in the store");
    ctx.store.set_option(FREQUENCY_START, range.start_hz / 1e9).await?;
    ctx.store.set_option(FREQUENCY_STOP, range.stop_hz / 1e9).await?;
    ctx.store.set_option(NUM_STEPS, f64::from(range.points)).await?;
    ctx.store.commit().await?;

    faults.extend(
        check_error_queue(&mut ctx.vna, policy, "setting network analyzer parameters").await?,
    );

    info!(
        "Starting S21 calibration: {} GHz to {} GHz, {} points",
        range.start_hz / 1e9,
        range.stop_hz / 1e9,
        range.points
    );
    ctx.vna.set_measurement(CHANNEL, TRACE, 2, 1).await?;
    ctx.vna.trigger().await?;
    ctx.vna.auto_scale(CHANNEL, TRACE).await?;
    let frequencies = ctx.vna.get_x(CHANNEL).await?;
    let data = ctx.vna.get_corrected_data(CHANNEL).await?;
    writer.write_trace(&frequencies, &data).await?;

    let calibration_faults =
        check_error_queue(&mut ctx.vna, policy, "calibrating network analyzer S21").await?;
    if calibration_faults.is_empty() {
        info!("S21 calibration successful");
    }
    faults.extend(calibration_faults);

    Ok(CalibrationReport { range, faults })
}
