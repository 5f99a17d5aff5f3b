//! Persistent configuration options shared between runs.
//!
//! The chamber remembers where the polarization motors were left and the last
//! frequency settings so the next run can move by the difference instead of
//! re-homing. Values are numbers rounded to two decimals.
//!
//! [`FileConfigStore`] keeps a JSON object on disk; [`MemoryConfigStore`] is the
//! in-process equivalent used by tests and simulated runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AppResult, ChamberError};

/// Test antenna polarization (degrees).
pub const ANTENNA_POLARIZATION: &str = "antenna_polarization";
/// Chamber antenna polarization (degrees).
pub const CHAMBER_POLARIZATION: &str = "chamber_polarization";
/// Sweep start frequency (GHz).
pub const FREQUENCY_START: &str = "frequency_start";
/// Sweep stop frequency (GHz).
pub const FREQUENCY_STOP: &str = "frequency_stop";
/// Sweep points.
pub const NUM_STEPS: &str = "num_steps";

/// Named numeric options with explicit commit.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fails with [`ChamberError::Store`] when the option has never been set.
    async fn get_option(&self, name: &str) -> AppResult<f64>;

    /// Stage a value; it is rounded to two decimals.
    async fn set_option(&mut self, name: &str, value: f64) -> AppResult<()>;

    /// Persist staged values.
    async fn commit(&mut self) -> AppResult<()>;

    /// Release the store. Uncommitted values are discarded.
    async fn close(&mut self) -> AppResult<()>;
}

fn round_option(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn missing(name: &str) -> ChamberError {
    ChamberError::Store(format!("option '{}' is not set", name))
}

fn check_value(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ChamberError::Validation(format!(
            "option '{}' must be finite, got {}",
            name, value
        )))
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// JSON file of `option -> value`.
pub struct FileConfigStore {
    path: PathBuf,
    committed: BTreeMap<String, f64>,
    staged: BTreeMap<String, f64>,
    closed: bool,
}

impl FileConfigStore {
    /// Open `path`. The parent directory must exist; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !tokio::fs::try_exists(&parent).await.unwrap_or(false) {
            return Err(ChamberError::Connection(format!(
                "configuration store directory {} does not exist",
                parent.display()
            )));
        }

        let committed = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Configuration store {} not found, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Opened configuration store {}", path.display());
        Ok(Self {
            path,
            staged: committed.clone(),
            committed,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(ChamberError::Store(format!(
                "configuration store {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_option(&self, name: &str) -> AppResult<f64> {
        self.ensure_open()?;
        self.staged.get(name).copied().ok_or_else(|| missing(name))
    }

    async fn set_option(&mut self, name: &str, value: f64) -> AppResult<()> {
        self.ensure_open()?;
        check_value(name, value)?;
        self.staged.insert(name.to_string(), round_option(value));
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        let text = serde_json::to_string_pretty(&self.staged)?;
        tokio::fs::write(&self.path, text).await?;
        self.committed = self.staged.clone();
        debug!("Committed configuration store {}", self.path.display());
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.staged = self.committed.clone();
        self.closed = true;
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Shared in-memory store; clones see the same committed values.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    committed: Arc<RwLock<BTreeMap<String, f64>>>,
    staged: BTreeMap<String, f64>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated (and committed) with `options`.
    pub fn with_options<'a>(options: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let values: BTreeMap<String, f64> = options
            .into_iter()
            .map(|(k, v)| (k.to_string(), round_option(v)))
            .collect();
        Self {
            committed: Arc::new(RwLock::new(values.clone())),
            staged: values,
        }
    }

    /// Committed values.
    pub async fn snapshot(&self) -> BTreeMap<String, f64> {
        self.committed.read().await.clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_option(&self, name: &str) -> AppResult<f64> {
        self.staged.get(name).copied().ok_or_else(|| missing(name))
    }

    async fn set_option(&mut self, name: &str, value: f64) -> AppResult<()> {
        check_value(name, value)?;
        self.staged.insert(name.to_string(), round_option(value));
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        *self.committed.write().await = self.staged.clone();
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.staged = self.committed.read().await.clone();
        Ok(())
    }
}
