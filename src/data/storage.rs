//! Result writers with clean feature flag handling.
//!
//! A sweep produces two files sharing a timestamp stem:
//!
//! - `<stamp>_s11.csv`: the baseline trace, one frequency row and one data row.
//! - `<stamp>_s21.csv`: `Angle,f1,f2,...` then one `angle,z1,z2,...` row per record.
//!
//! Single-trace procedures write one frequency row and one data row to a fixed
//! file name through a [`TraceWriter`]; a rerun replaces the previous trace.
use std::sync::Arc;

use async_trait::async_trait;
use num_complex::Complex64;
use tokio::sync::Mutex;

use super::SweepRecord;
use crate::error::AppResult;

/// `%Y%m%d%H%M%S` stem for a pair of result files.
pub fn file_stem(time: chrono::DateTime<chrono::Local>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}

/// Sink for sweep output.
#[async_trait]
pub trait ResultWriter: Send {
    /// Baseline (reflection) trace captured before the angular sweep.
    async fn write_baseline(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()>;

    /// Frequency header of the angle-indexed file.
    async fn write_sweep_header(&mut self, frequencies: &[f64]) -> AppResult<()>;

    async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()>;

    /// Flush and release the outputs.
    async fn finish(&mut self) -> AppResult<()>;
}

/// File written by the single-position gain measurement.
pub const GAIN_TRACE_FILE: &str = "max_gain_s21.csv";

/// File written by the transmission calibration.
pub const S21_CALIBRATION_FILE: &str = "s21_calibration.csv";

/// Sink for a single captured trace.
#[async_trait]
pub trait TraceWriter: Send {
    /// Frequency row followed by the data row.
    async fn write_trace(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()>;
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::data::format::{complex_fields, format_angle, frequency_fields};
    use crate::error::ChamberError;
    use std::fs::File;
    use std::path::{Path, PathBuf};

    /// Writes `<stem>_s11.csv` and `<stem>_s21.csv` side by side.
    pub struct CsvResultWriter {
        s11_path: PathBuf,
        s21_path: PathBuf,
        s11: Option<csv::Writer<File>>,
        s21: Option<csv::Writer<File>>,
    }

    fn open(path: &Path) -> AppResult<csv::Writer<File>> {
        Ok(csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_path(path)?)
    }

    fn closed(path: &Path) -> ChamberError {
        ChamberError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("{} is already closed", path.display()),
        ))
    }

    impl CsvResultWriter {
        /// Create both files in `dir` (created if missing) under `stem`.
        pub fn create(dir: impl AsRef<Path>, stem: &str) -> AppResult<Self> {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)?;

            let s11_path = dir.join(format!("{}_s11.csv", stem));
            let s21_path = dir.join(format!("{}_s21.csv", stem));
            let s11 = open(&s11_path)?;
            let s21 = open(&s21_path)?;
            log::info!(
                "Result files: '{}', '{}'",
                s11_path.display(),
                s21_path.display()
            );

            Ok(Self {
                s11_path,
                s21_path,
                s11: Some(s11),
                s21: Some(s21),
            })
        }

        /// Create both files stamped with the current local time.
        pub fn create_now(dir: impl AsRef<Path>) -> AppResult<Self> {
            Self::create(dir, &file_stem(chrono::Local::now()))
        }

        pub fn s11_path(&self) -> &Path {
            &self.s11_path
        }

        pub fn s21_path(&self) -> &Path {
            &self.s21_path
        }
    }

    #[async_trait]
    impl ResultWriter for CsvResultWriter {
        async fn write_baseline(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()> {
            let writer = self.s11.as_mut().ok_or_else(|| closed(&self.s11_path))?;
            writer.write_record(frequency_fields(frequencies))?;
            writer.write_record(complex_fields(data))?;
            writer.flush()?;
            Ok(())
        }

        async fn write_sweep_header(&mut self, frequencies: &[f64]) -> AppResult<()> {
            let writer = self.s21.as_mut().ok_or_else(|| closed(&self.s21_path))?;
            let mut header = Vec::with_capacity(frequencies.len() + 1);
            header.push("Angle".to_string());
            header.extend(frequency_fields(frequencies));
            writer.write_record(header)?;
            Ok(())
        }

        async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()> {
            let writer = self.s21.as_mut().ok_or_else(|| closed(&self.s21_path))?;
            let mut row = Vec::with_capacity(record.response.len() + 1);
            row.push(format_angle(record.angle_degrees));
            row.extend(complex_fields(&record.response));
            writer.write_record(row)?;
            writer.flush()?;
            Ok(())
        }

        async fn finish(&mut self) -> AppResult<()> {
            for mut writer in [self.s11.take(), self.s21.take()].into_iter().flatten() {
                writer.flush()?;
            }
            log::info!("CSV result writer shut down.");
            Ok(())
        }
    }

    /// One trace in one file, truncated on every write.
    pub struct CsvTraceWriter {
        path: PathBuf,
    }

    impl CsvTraceWriter {
        /// Target `dir/file_name`; `dir` is created if missing.
        pub fn create(dir: impl AsRef<Path>, file_name: &str) -> AppResult<Self> {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)?;
            Ok(Self {
                path: dir.join(file_name),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl TraceWriter for CsvTraceWriter {
        async fn write_trace(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()> {
            let mut writer = open(&self.path)?;
            writer.write_record(frequency_fields(frequencies))?;
            writer.write_record(complex_fields(data))?;
            writer.flush()?;
            log::info!("Trace written to '{}'", self.path.display());
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::ChamberError;
    use std::path::Path;

    pub struct CsvResultWriter;

    impl CsvResultWriter {
        pub fn create(_dir: impl AsRef<Path>, _stem: &str) -> AppResult<Self> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn create_now(_dir: impl AsRef<Path>) -> AppResult<Self> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    #[async_trait]
    impl ResultWriter for CsvResultWriter {
        async fn write_baseline(&mut self, _frequencies: &[f64], _data: &[Complex64]) -> AppResult<()> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn write_sweep_header(&mut self, _frequencies: &[f64]) -> AppResult<()> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn write_record(&mut self, _record: &SweepRecord) -> AppResult<()> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn finish(&mut self) -> AppResult<()> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    pub struct CsvTraceWriter;

    impl CsvTraceWriter {
        pub fn create(_dir: impl AsRef<Path>, _file_name: &str) -> AppResult<Self> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    #[async_trait]
    impl TraceWriter for CsvTraceWriter {
        async fn write_trace(&mut self, _frequencies: &[f64], _data: &[Complex64]) -> AppResult<()> {
            Err(ChamberError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{CsvResultWriter, CsvTraceWriter};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{CsvResultWriter, CsvTraceWriter};

// ============================================================================
// In-memory Writer
// ============================================================================

#[derive(Debug, Default)]
struct CapturedResults {
    baseline: Option<(Vec<f64>, Vec<Complex64>)>,
    header: Option<Vec<f64>>,
    records: Vec<SweepRecord>,
    finished: bool,
}

/// Keeps everything in memory; clones share the captured results.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultWriter {
    inner: Arc<Mutex<CapturedResults>>,
}

impl MemoryResultWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn baseline(&self) -> Option<(Vec<f64>, Vec<Complex64>)> {
        self.inner.lock().await.baseline.clone()
    }

    pub async fn header(&self) -> Option<Vec<f64>> {
        self.inner.lock().await.header.clone()
    }

    pub async fn records(&self) -> Vec<SweepRecord> {
        self.inner.lock().await.records.clone()
    }

    /// Angles of the captured records, in order.
    pub async fn angles(&self) -> Vec<f64> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .map(|r| r.angle_degrees)
            .collect()
    }

    pub async fn is_finished(&self) -> bool {
        self.inner.lock().await.finished
    }
}

#[async_trait]
impl ResultWriter for MemoryResultWriter {
    async fn write_baseline(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()> {
        self.inner.lock().await.baseline = Some((frequencies.to_vec(), data.to_vec()));
        Ok(())
    }

    async fn write_sweep_header(&mut self, frequencies: &[f64]) -> AppResult<()> {
        self.inner.lock().await.header = Some(frequencies.to_vec());
        Ok(())
    }

    async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()> {
        self.inner.lock().await.records.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.inner.lock().await.finished = true;
        Ok(())
    }
}

/// Keeps the last written trace; clones share it.
#[derive(Debug, Clone, Default)]
pub struct MemoryTraceWriter {
    trace: Arc<Mutex<Option<(Vec<f64>, Vec<Complex64>)>>>,
}

impl MemoryTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trace(&self) -> Option<(Vec<f64>, Vec<Complex64>)> {
        self.trace.lock().await.clone()
    }
}

#[async_trait]
impl TraceWriter for MemoryTraceWriter {
    async fn write_trace(&mut self, frequencies: &[f64], data: &[Complex64]) -> AppResult<()> {
        *self.trace.lock().await = Some((frequencies.to_vec(), data.to_vec()));
        Ok(())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_stem() {
        let time = chrono::Local
            .with_ymd_and_hms(2024, 3, 7, 9, 5, 1)
            .single()
            .unwrap();
        assert_eq!(file_stem(time), "20240307090501");
    }

    #[tokio::test]
    async fn test_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::create(dir.path().join("out"), "20240101000000").unwrap();
        let freqs = [1.0e9, 1.5e9];

        writer
            .write_baseline(&freqs, &[Complex64::new(0.5, -0.25), Complex64::new(1.0, 0.0)])
            .await
            .unwrap();
        writer.write_sweep_header(&freqs).await.unwrap();
        let record = SweepRecord {
            angle_degrees: 180.0,
            frequencies: freqs.to_vec(),
            response: vec![Complex64::new(0.1, 0.2), Complex64::new(-0.3, -0.4)],
        };
        writer.write_record(&record).await.unwrap();
        writer.write_record(&record.at_angle(-180.0)).await.unwrap();
        writer.finish().await.unwrap();

        let s11 = std::fs::read_to_string(writer.s11_path()).unwrap();
        assert_eq!(s11, "1000000000,1500000000\n0.5-0.25i,1+0i\n");

        let s21 = std::fs::read_to_string(writer.s21_path()).unwrap();
        assert_eq!(
            s21,
            "Angle,1000000000,1500000000\n180,0.1+0.2i,-0.3-0.4i\n-180,0.1+0.2i,-0.3-0.4i\n"
        );
    }

    #[tokio::test]
    async fn test_trace_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvTraceWriter::create(dir.path().join("out"), GAIN_TRACE_FILE).unwrap();

        writer
            .write_trace(&[1.0e9, 2.0e9], &[Complex64::new(1.0, 1.0), Complex64::new(2.0, -2.0)])
            .await
            .unwrap();
        writer
            .write_trace(&[3.0e9], &[Complex64::new(0.5, 0.0)])
            .await
            .unwrap();

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(contents, "3000000000\n0.5+0i\n");
        assert!(writer.path().ends_with(GAIN_TRACE_FILE));
    }

    #[tokio::test]
    async fn test_write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::create(dir.path(), "stem").unwrap();
        writer.finish().await.unwrap();
        assert!(writer.write_sweep_header(&[1.0]).await.is_err());
    }
}
