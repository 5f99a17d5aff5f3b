//! End-to-end sweep tests against the simulated motor controller and analyzer.

#![cfg(feature = "storage_csv")]

use std::time::Duration;

use chamber_daq::data::{CsvResultWriter, MemoryResultWriter};
use chamber_daq::error::ChamberError;
use chamber_daq::experiment::{
    ErrorPolicy, SweepContext, SweepOptions, SweepParameters, SweepSequencer, SweepState,
};
use chamber_daq::hardware::mock::MockMotorController;
use chamber_daq::hardware::{MotorProtocol, MotorSet, Port};
use chamber_daq::instrument::mock::MockVna;
use chamber_daq::instrument::{VnaSession, VnaTiming};
use chamber_daq::store::{
    MemoryConfigStore, ANTENNA_POLARIZATION, CHAMBER_POLARIZATION, FREQUENCY_START,
    FREQUENCY_STOP, NUM_STEPS,
};
use tempfile::TempDir;

struct Rig {
    bus: MockMotorController,
    vna: MockVna,
    store: MemoryConfigStore,
}

impl Rig {
    fn new() -> Self {
        Self {
            bus: MockMotorController::new(),
            vna: MockVna::new(),
            store: MemoryConfigStore::with_options([
                (ANTENNA_POLARIZATION, 0.0),
                (CHAMBER_POLARIZATION, 0.0),
            ]),
        }
    }

    fn context(&self) -> SweepContext {
        let protocol = MotorProtocol::new(Box::new(self.bus.clone()), Duration::from_millis(20));
        SweepContext::new(
            MotorSet::new(protocol).unwrap(),
            VnaSession::new(Box::new(self.vna.clone()), VnaTiming::immediate()),
            Box::new(self.store.clone()),
        )
    }
}

fn options(error_policy: ErrorPolicy) -> SweepOptions {
    SweepOptions {
        step_settle: Duration::ZERO,
        error_policy,
        ..SweepOptions::default()
    }
}

fn params(start: f64, increment: f64, stop: f64) -> SweepParameters {
    SweepParameters {
        frequency_start_hz: 1.0e9,
        frequency_stop_hz: 2.0e9,
        points: 3,
        start,
        increment,
        stop,
        tpolar: 0.0,
        cpolar: 0.0,
        translation: false,
    }
}

fn first_column(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split(',').next().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_sweep_writes_both_result_files() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new();
    let mut ctx = rig.context();
    let mut writer = CsvResultWriter::create(dir.path(), "20240101120000").unwrap();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));

    let report = sequencer
        .run(&mut ctx, &mut writer, &params(0.0, 30.0, 90.0))
        .await
        .unwrap();
    ctx.finish(Ok(())).await.unwrap();

    assert_eq!(report.steps, 4);
    assert_eq!(report.records_written, 4);
    assert_eq!(sequencer.state(), SweepState::Complete);

    let s11 = std::fs::read_to_string(dir.path().join("20240101120000_s11.csv")).unwrap();
    let lines: Vec<&str> = s11.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "1000000000,1500000000,2000000000");
    assert_eq!(lines[1].split(',').count(), 3);
    assert!(lines[1].split(',').all(|v| v.ends_with('i')));

    let s21 = std::fs::read_to_string(dir.path().join("20240101120000_s21.csv")).unwrap();
    assert_eq!(
        s21.lines().next().unwrap(),
        "Angle,1000000000,1500000000,2000000000"
    );
    assert_eq!(first_column(&s21)[1..], ["0", "30", "60", "90"]);

    // Stand returns home; hardware released
    assert_eq!(rig.bus.index(Port::new(1).unwrap()).await, 0);
    assert!(rig.bus.is_closed().await);
    assert!(rig.vna.is_closed().await);
}

#[tokio::test]
async fn test_full_circle_duplicates_180_and_skips_360() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new();
    let mut ctx = rig.context();
    let mut writer = CsvResultWriter::create(dir.path(), "circle").unwrap();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));

    let report = sequencer
        .run(&mut ctx, &mut writer, &params(0.0, 90.0, 360.0))
        .await
        .unwrap();
    ctx.finish(Ok(())).await.unwrap();

    assert_eq!(report.steps, 4);
    assert_eq!(report.records_written, 5);

    let s21 = std::fs::read_to_string(writer.s21_path()).unwrap();
    let rows: Vec<&str> = s21.lines().skip(1).collect();
    assert_eq!(first_column(&s21)[1..], ["0", "90", "180", "-180", "-90"]);

    // The -180 row carries the same trace as the 180 row
    let tail = |row: &str| row.split_once(',').map(|(_, rest)| rest.to_string());
    assert_eq!(tail(rows[2]), tail(rows[3]));
}

#[tokio::test]
async fn test_sweep_persists_accepted_settings() {
    let rig = Rig::new();
    let mut ctx = rig.context();
    let mut writer = MemoryResultWriter::new();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));
    let mut request = params(0.0, 45.0, 90.0);
    request.frequency_stop_hz = 20.0e9;
    request.points = 5000;
    request.tpolar = 90.0;
    request.cpolar = 45.0;

    let report = sequencer.run(&mut ctx, &mut writer, &request).await.unwrap();
    ctx.finish(Ok(())).await.unwrap();

    assert_eq!(report.range.stop_hz, MockVna::MAX_FREQUENCY_HZ);
    assert_eq!(report.range.points, MockVna::MAX_POINTS);
    assert_eq!(writer.header().await.unwrap().len(), MockVna::MAX_POINTS as usize);

    let stored = rig.store.snapshot().await;
    assert_eq!(stored[FREQUENCY_START], 1.0);
    assert_eq!(stored[FREQUENCY_STOP], 8.5);
    assert_eq!(stored[NUM_STEPS], 1601.0);
    assert_eq!(stored[ANTENNA_POLARIZATION], 90.0);
    assert_eq!(stored[CHAMBER_POLARIZATION], 45.0);
    assert_eq!(report.final_tpolar, 90.0);
    assert_eq!(report.final_cpolar, 45.0);
}

#[tokio::test]
async fn test_instrument_fault_policy() {
    let rig = Rig::new();
    rig.vna
        .error_on(":SENS1:FREQ:STOP", -222, "Data out of range")
        .await;

    let mut ctx = rig.context();
    let mut writer = MemoryResultWriter::new();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));
    let report = sequencer
        .run(&mut ctx, &mut writer, &params(0.0, 45.0, 90.0))
        .await
        .unwrap();
    assert_eq!(report.faults.len(), 1);
    assert_eq!(report.faults[0].code, -222);
    assert_eq!(writer.records().await.len(), 3);

    let mut ctx = rig.context();
    let mut writer = MemoryResultWriter::new();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Abort));
    let err = sequencer
        .run(&mut ctx, &mut writer, &params(0.0, 45.0, 90.0))
        .await
        .unwrap_err();
    assert!(matches!(err, ChamberError::Instrument(_)));
    assert_eq!(sequencer.state(), SweepState::AcquireBaseline);
    assert!(writer.records().await.is_empty());
    assert!(writer.is_finished().await);
}

#[tokio::test]
async fn test_stalled_rotation_aborts_and_releases_hardware() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new();
    // Second step of a 0-90/30 sweep: rotate by 30 degrees
    rig.bus.stall_command("I1M-1200,R").await;

    let mut ctx = rig.context();
    let mut writer = CsvResultWriter::create(dir.path(), "stalled").unwrap();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));
    let outcome = sequencer
        .run(&mut ctx, &mut writer, &params(0.0, 30.0, 90.0))
        .await;
    assert_eq!(sequencer.state(), SweepState::StepLoop { step: 1, of: 4 });

    let err = ctx.finish(outcome).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(rig.bus.is_closed().await);
    assert!(rig.vna.is_closed().await);
    assert!(rig.vna.writes().await.iter().any(|w| w == ":DISP:ENAB ON"));

    // The row captured before the stall is on disk
    let s21 = std::fs::read_to_string(writer.s21_path()).unwrap();
    assert_eq!(first_column(&s21)[1..], ["0"]);
}

#[tokio::test]
async fn test_translation_is_undone() {
    let rig = Rig::new();
    let mut ctx = rig.context();
    let mut writer = MemoryResultWriter::new();
    let mut sequencer = SweepSequencer::new(options(ErrorPolicy::Warn));
    let mut request = params(0.0, 90.0, 90.0);
    request.translation = true;

    sequencer.run(&mut ctx, &mut writer, &request).await.unwrap();

    let commands = rig.bus.commands().await;
    assert!(commands.contains(&"I2M26000,R".to_string()));
    assert!(commands.contains(&"I2M-26000,R".to_string()));
    assert_eq!(rig.bus.index(Port::new(2).unwrap()).await, 0);
}
