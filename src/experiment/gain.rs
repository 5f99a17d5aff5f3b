//! Single-position S21 capture.
//!
//! Positions the stand exactly as a sweep would, captures one transmission
//! trace at the requested angle and homes the stand again. Used to peak the
//! link before committing to a full pattern.

use tracing::{debug, info};

use super::context::SweepContext;
use super::polarization::set_polarization;
use super::sweep::{
    acquire_trace, apply_error_policy, check_error_queue, reconcile_range, AcceptedRange,
    SweepOptions,
};
use crate::data::TraceWriter;
use crate::error::AppResult;
use crate::instrument::InstrumentFault;
use crate::store::{
    ANTENNA_POLARIZATION, CHAMBER_POLARIZATION, FREQUENCY_START, FREQUENCY_STOP, NUM_STEPS,
};

const CHANNEL: u8 = 1;
const TRACE: u8 = 1;

/// Requested gain measurement, already sanitized.
#[derive(Debug, Clone, PartialEq)]
pub struct GainParameters {
    pub frequency_start_hz: f64,
    pub frequency_stop_hz: f64,
    pub points: u32,
    /// Stand angle in degrees.
    pub angle: f64,
    pub tpolar: f64,
    pub cpolar: f64,
    /// Translate the stand into measurement position first.
    pub translation: bool,
}

/// Outcome of a gain measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct GainReport {
    pub range: AcceptedRange,
    /// Samples in the captured trace.
    pub samples: usize,
    pub faults: Vec<InstrumentFault>,
}

/// Capture one S21 trace at `params.angle` and record the settings used.
///
/// The error policy comes from `options`; the stand is homed and the
/// translation undone before the store is updated.
pub async fn run_gain_measurement(
    ctx: &mut SweepContext,
    writer: &mut dyn TraceWriter,
    params: &GainParameters,
    options: &SweepOptions,
) -> AppResult<GainReport> {
    let policy = options.error_policy;

    ctx.motors.rotation().goto_zero().await?;
    if params.translation {
        ctx.motors
            .translation()
            .rotate_by_degrees(options.stand_offset_deg)
            .await?;
    }
    set_polarization(&ctx.motors, ctx.store.as_ref(), params.tpolar, params.cpolar).await?;
    info!("Start position: {}", params.angle);
    ctx.motors.rotation().rotate_by_degrees(params.angle).await?;
    info!("Motor setup complete");

    ctx.vna.load_state().await?;
    let mut faults = apply_error_policy(
        ctx.vna.setup(CHANNEL, TRACE).await?,
        policy,
        "configuring the network analyzer channel",
    )?;
    let range = reconcile_range(
        &mut ctx.vna,
        params.frequency_start_hz,
        params.frequency_stop_hz,
        params.points,
    )
    .await?;
    faults.extend(
        check_error_queue(&mut ctx.vna, policy, "setting network analyzer parameters").await?,
    );

    info!(
        "Measuring S21: {} GHz to {} GHz, {} points",
        range.start_hz / 1e9,
        range.stop_hz / 1e9,
        range.points
    );
    ctx.vna.set_measurement(CHANNEL, TRACE, 2, 1).await?;
    let (frequencies, data) = acquire_trace(&mut ctx.vna, true).await?;
    writer.write_trace(&frequencies, &data).await?;

    ctx.motors.rotation().goto_zero().await?;
    if params.translation {
        ctx.motors
            .translation()
            .rotate_by_degrees(-options.stand_offset_deg)
            .await?;
    }

    debug!("Updating polarization and frequency settings in the store");
    ctx.store.set_option(ANTENNA_POLARIZATION, params.tpolar).await?;
    ctx.store.set_option(CHAMBER_POLARIZATION, params.cpolar).await?;
    ctx.store.set_option(FREQUENCY_START, range.start_hz / 1e9).await?;
    ctx.store.set_option(FREQUENCY_STOP, range.stop_hz / 1e9).await?;
    ctx.store.set_option(NUM_STEPS, f64::from(range.points)).await?;
    ctx.store.commit().await?;

    let measurement_faults = check_error_queue(&mut ctx.vna, policy, "measuring S21").await?;
    if measurement_faults.is_empty() {
        info!("S21 measurement successful");
    }
    faults.extend(measurement_faults);

    Ok(GainReport {
        range,
        samples: data.len(),
        faults,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryTraceWriter;
    use crate::error::ChamberError;
    use crate::experiment::ErrorPolicy;
    use crate::hardware::mock::MockMotorController;
    use crate::hardware::{MotorProtocol, MotorSet, Port};
    use crate::instrument::mock::MockVna;
    use crate::instrument::{VnaSession, VnaTiming};
    use crate::store::MemoryConfigStore;
    use std::time::Duration;

    struct Rig {
        bus: MockMotorController,
        vna: MockVna,
        store: MemoryConfigStore,
    }

    fn rig() -> Rig {
        Rig {
            bus: MockMotorController::new(),
            vna: MockVna::new(),
            store: MemoryConfigStore::with_options([
                (ANTENNA_POLARIZATION, 0.0),
                (CHAMBER_POLARIZATION, 0.0),
            ]),
        }
    }

    impl Rig {
        fn context(&self) -> SweepContext {
            let protocol =
                MotorProtocol::new(Box::new(self.bus.clone()), Duration::from_millis(10));
            SweepContext::new(
                MotorSet::new(protocol).unwrap(),
                VnaSession::new(Box::new(self.vna.clone()), VnaTiming::immediate()),
                Box::new(self.store.clone()),
            )
        }
    }

    fn params(angle: f64, translation: bool) -> GainParameters {
        GainParameters {
            frequency_start_hz: 1.0e9,
            frequency_stop_hz: 2.0e9,
            points: 11,
            angle,
            tpolar: 90.0,
            cpolar: 0.0,
            translation,
        }
    }

    fn options(error_policy: ErrorPolicy) -> SweepOptions {
        SweepOptions {
            step_settle: Duration::ZERO,
            error_policy,
            ..SweepOptions::default()
        }
    }

    #[tokio::test]
    async fn test_gain_captures_one_transmission_trace() {
        let rig = rig();
        let mut ctx = rig.context();
        let mut writer = MemoryTraceWriter::new();

        let report = run_gain_measurement(
            &mut ctx,
            &mut writer,
            &params(45.0, false),
            &options(ErrorPolicy::Warn),
        )
        .await
        .unwrap();

        assert_eq!(report.samples, 11);
        assert!(report.faults.is_empty());
        let (frequencies, data) = writer.trace().await.unwrap();
        assert_eq!(frequencies.len(), 11);
        assert_eq!(data.len(), 11);
        assert_eq!(rig.vna.trigger_count().await, 1);
        assert!(rig.vna.writes().await.contains(&":CALC1:PAR1:DEF S21".to_string()));

        // Rotated out to the angle and homed again
        let commands = rig.bus.commands().await;
        let out = commands.iter().position(|c| c == "I1M-1800,R").unwrap();
        assert!(commands[out..].contains(&"IA1M0,R".to_string()));
        assert_eq!(rig.bus.index(Port::new(1).unwrap()).await, 0);
        assert_eq!(rig.bus.index(Port::new(3).unwrap()).await, -9000);
    }

    #[tokio::test]
    async fn test_gain_records_settings() {
        let rig = rig();
        let mut ctx = rig.context();
        let mut writer = MemoryTraceWriter::new();
        let mut request = params(0.0, true);
        request.points = 5000;

        let report = run_gain_measurement(&mut ctx, &mut writer, &request, &options(ErrorPolicy::Warn))
            .await
            .unwrap();
        assert_eq!(report.range.points, MockVna::MAX_POINTS);

        let stored = rig.store.snapshot().await;
        assert_eq!(stored[ANTENNA_POLARIZATION], 90.0);
        assert_eq!(stored[CHAMBER_POLARIZATION], 0.0);
        assert_eq!(stored[FREQUENCY_START], 1.0);
        assert_eq!(stored[FREQUENCY_STOP], 2.0);
        assert_eq!(stored[NUM_STEPS], 1601.0);

        let commands = rig.bus.commands().await;
        assert!(commands.contains(&"I2M26000,R".to_string()));
        assert!(commands.contains(&"I2M-26000,R".to_string()));
        assert_eq!(rig.bus.index(Port::new(2).unwrap()).await, 0);
    }

    #[tokio::test]
    async fn test_gain_abort_policy() {
        let rig = rig();
        rig.vna
            .error_on(":SENS1:FREQ:STAR", -222, "Data out of range")
            .await;
        let mut ctx = rig.context();
        let mut writer = MemoryTraceWriter::new();

        let err = run_gain_measurement(
            &mut ctx,
            &mut writer,
            &params(0.0, false),
            &options(ErrorPolicy::Abort),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChamberError::Instrument(_)));
        assert!(writer.trace().await.is_none());
    }
}
