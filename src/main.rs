//! CLI entry point for the antenna chamber.
//!
//! # Usage
//!
//! Measure a 0-360 pattern from 1 to 2 GHz (201 points) every 5 degrees with
//! both antennas vertically polarized:
//! ```bash
//! chamber_daq sweep 1 2 201 0 5 360 0 0
//! ```
//!
//! Other procedures:
//! ```bash
//! chamber_daq polarize 90 90
//! chamber_daq align
//! chamber_daq max-gain 1 2 201 0 90 90
//! chamber_daq calibrate-s11 1 2 201
//! chamber_daq calibrate-s21 1 2
//! ```
//!
//! `--simulate` swaps the motor controller and network analyzer for their
//! simulated counterparts and keeps stored options in memory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chamber_daq::adapters::SerialAdapter;
use chamber_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use chamber_daq::data::{CsvResultWriter, CsvTraceWriter, GAIN_TRACE_FILE, S21_CALIBRATION_FILE};
use chamber_daq::error::AppResult;
use chamber_daq::experiment::{
    run_gain_measurement, run_motor_alignment, run_polarization_rotation, run_s11_calibration,
    run_s21_calibration, sanitize, sanitize_gain, sanitize_polarization, CalibrationReport,
    GainParameters, SweepContext, SweepOptions, SweepParameters, SweepSequencer,
};
use chamber_daq::hardware::mock::MockMotorController;
use chamber_daq::hardware::{MotorProtocol, MotorSet};
use chamber_daq::instrument::mock::MockVna;
use chamber_daq::instrument::{VnaSession, VnaTiming};
use chamber_daq::store::{ConfigStore, FileConfigStore, MemoryConfigStore};

#[derive(Parser)]
#[command(name = "chamber_daq")]
#[command(about = "Antenna chamber motor and network analyzer control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure S21 over a range of stand angles
    #[command(allow_negative_numbers = true)]
    Sweep {
        /// Start frequency (GHz)
        f_start_ghz: f64,
        /// Stop frequency (GHz)
        f_stop_ghz: f64,
        /// Frequency points
        points: u32,
        /// Start angle (degrees)
        start: f64,
        /// Angle increment (degrees)
        increment: f64,
        /// Stop angle (degrees)
        stop: f64,
        /// Test antenna polarization (degrees)
        tpolar: f64,
        /// Chamber antenna polarization (degrees)
        cpolar: f64,
        /// Leave the stand translation where it is
        #[arg(long)]
        no_translation: bool,
    },

    /// Rotate both antenna polarizations
    #[command(allow_negative_numbers = true)]
    Polarize {
        /// Test antenna polarization (degrees)
        tpolar: f64,
        /// Chamber antenna polarization (degrees)
        cpolar: f64,
    },

    /// Measure S21 at a single stand angle
    #[command(name = "max-gain", allow_negative_numbers = true)]
    MaxGain {
        /// Start frequency (GHz)
        f_start_ghz: f64,
        /// Stop frequency (GHz)
        f_stop_ghz: f64,
        /// Frequency points
        points: u32,
        /// Stand angle (degrees)
        angle: f64,
        /// Test antenna polarization (degrees)
        tpolar: f64,
        /// Chamber antenna polarization (degrees)
        cpolar: f64,
        /// Leave the stand translation where it is
        #[arg(long)]
        no_translation: bool,
    },

    /// Interactively jog motors and set their zero positions
    Align,

    /// Run a one-port electronic calibration
    #[command(name = "calibrate-s11")]
    CalibrateS11 {
        /// Start frequency (GHz)
        f_start_ghz: f64,
        /// Stop frequency (GHz)
        f_stop_ghz: f64,
        /// Frequency points
        points: u32,
    },

    /// Capture the S21 reference trace
    #[command(name = "calibrate-s21")]
    CalibrateS21 {
        /// Start frequency (GHz)
        f_start_ghz: f64,
        /// Stop frequency (GHz)
        f_stop_ghz: f64,
        /// Frequency points
        #[arg(default_value_t = 801)]
        points: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&settings.application.log_level);

    let mut ctx = open_context(&settings, cli.simulate).await?;
    let outcome = match cli.command {
        Commands::Sweep {
            f_start_ghz,
            f_stop_ghz,
            points,
            start,
            increment,
            stop,
            tpolar,
            cpolar,
            no_translation,
        } => {
            let params = SweepParameters {
                frequency_start_hz: f_start_ghz * 1e9,
                frequency_stop_hz: f_stop_ghz * 1e9,
                points,
                start,
                increment,
                stop,
                tpolar,
                cpolar,
                translation: !no_translation,
            };
            run_sweep(&mut ctx, &settings, params).await
        }
        Commands::Polarize { tpolar, cpolar } => run_polarize(&mut ctx, tpolar, cpolar).await,
        Commands::MaxGain {
            f_start_ghz,
            f_stop_ghz,
            points,
            angle,
            tpolar,
            cpolar,
            no_translation,
        } => {
            let params = GainParameters {
                frequency_start_hz: f_start_ghz * 1e9,
                frequency_stop_hz: f_stop_ghz * 1e9,
                points,
                angle,
                tpolar,
                cpolar,
                translation: !no_translation,
            };
            run_max_gain(&mut ctx, &settings, params).await
        }
        Commands::Align => {
            let mut input = tokio::io::BufReader::new(tokio::io::stdin());
            let mut output = tokio::io::stdout();
            run_motor_alignment(&mut ctx, &mut input, &mut output).await
        }
        Commands::CalibrateS11 {
            f_start_ghz,
            f_stop_ghz,
            points,
        } => run_s11_calibration(
            &mut ctx,
            f_start_ghz * 1e9,
            f_stop_ghz * 1e9,
            points,
            settings.sweep.error_policy,
        )
        .await
        .map(|report| log_calibration(&report)),
        Commands::CalibrateS21 {
            f_start_ghz,
            f_stop_ghz,
            points,
        } => run_s21_reference(&mut ctx, &settings, f_start_ghz * 1e9, f_stop_ghz * 1e9, points)
            .await,
    };

    ctx.finish(outcome).await?;
    info!("Done");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_sweep(
    ctx: &mut SweepContext,
    settings: &Settings,
    params: SweepParameters,
) -> AppResult<()> {
    let params = sanitize(params)?;
    let mut writer = CsvResultWriter::create_now(&settings.application.data_dir)?;
    let mut sequencer = SweepSequencer::new(SweepOptions::from(settings));
    let report = sequencer.run(ctx, &mut writer, &params).await?;

    info!(
        "Sweep complete: {} positions, {} rows",
        report.steps, report.records_written
    );
    if !report.faults.is_empty() {
        warn!("{} network analyzer error(s) during the sweep", report.faults.len());
    }
    Ok(())
}

async fn run_max_gain(
    ctx: &mut SweepContext,
    settings: &Settings,
    params: GainParameters,
) -> AppResult<()> {
    let params = sanitize_gain(params)?;
    let mut writer = CsvTraceWriter::create(&settings.application.data_dir, GAIN_TRACE_FILE)?;
    let report =
        run_gain_measurement(ctx, &mut writer, &params, &SweepOptions::from(settings)).await?;

    info!("Captured {} samples at {} degrees", report.samples, params.angle);
    if !report.faults.is_empty() {
        warn!("{} network analyzer error(s) during the measurement", report.faults.len());
    }
    Ok(())
}

async fn run_s21_reference(
    ctx: &mut SweepContext,
    settings: &Settings,
    start_hz: f64,
    stop_hz: f64,
    points: u32,
) -> AppResult<()> {
    let mut writer =
        CsvTraceWriter::create(&settings.application.data_dir, S21_CALIBRATION_FILE)?;
    let report = run_s21_calibration(
        ctx,
        &mut writer,
        start_hz,
        stop_hz,
        points,
        settings.sweep.error_policy,
    )
    .await?;
    log_calibration(&report);
    Ok(())
}

fn log_calibration(report: &CalibrationReport) {
    info!(
        "Calibrated {} GHz to {} GHz, {} points",
        report.range.start_hz / 1e9,
        report.range.stop_hz / 1e9,
        report.range.points
    );
}

async fn run_polarize(ctx: &mut SweepContext, tpolar: f64, cpolar: f64) -> AppResult<()> {
    let (tpolar, cpolar) = sanitize_polarization(tpolar, cpolar)?;
    run_polarization_rotation(ctx, tpolar, cpolar).await
}

/// Store first, then motors, then the analyzer. Anything already opened is
/// released when a later step fails.
async fn open_context(settings: &Settings, simulate: bool) -> Result<SweepContext> {
    let mut store: Box<dyn ConfigStore> = if simulate {
        Box::new(MemoryConfigStore::new())
    } else {
        Box::new(
            FileConfigStore::open(&settings.store.path)
                .await
                .context("Failed to open configuration store")?,
        )
    };

    let protocol = if simulate {
        MotorProtocol::new(Box::new(MockMotorController::new()), settings.motor_bus.timeout())
    } else {
        match SerialAdapter::connect(settings.motor_bus.port.clone(), settings.motor_bus.baud_rate).await {
            Ok(adapter) => MotorProtocol::new(Box::new(adapter), settings.motor_bus.timeout()),
            Err(e) => {
                close_store(store.as_mut()).await;
                return Err(e).context("Opening motor controller failed");
            }
        }
    };
    info!("Motor controller opened");

    let motors = match MotorSet::new(protocol) {
        Ok(motors) => motors,
        Err(e) => {
            close_store(store.as_mut()).await;
            return Err(e.into());
        }
    };

    let vna = if simulate {
        Ok(VnaSession::new(Box::new(MockVna::new()), VnaTiming::immediate()))
    } else {
        VnaSession::connect(&settings.vna).await
    };
    let vna = match vna {
        Ok(vna) => vna,
        Err(e) => {
            if let Err(shutdown) = motors.shutdown().await {
                warn!("Motor shutdown failed: {}", shutdown);
            }
            close_store(store.as_mut()).await;
            return Err(e).context("Connecting to network analyzer failed");
        }
    };

    let mut ctx = SweepContext::new(motors, vna, store);
    if let Err(e) = ctx.motors.initialize(&settings.motors).await {
        if let Err(shutdown) = ctx.shutdown().await {
            warn!("Shutdown after failed initialization also failed: {}", shutdown);
        }
        return Err(e).context("Initializing motors failed");
    }
    Ok(ctx)
}

async fn close_store(store: &mut dyn ConfigStore) {
    if let Err(e) = store.close().await {
        warn!("Configuration store close failed: {}", e);
    }
}
