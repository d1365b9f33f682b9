use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::Resources;
use crate::{wlog_debug, Error, Result};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.25;
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 2_000;
pub const DEFAULT_BOTTLENECK_LIMIT: usize = 3;
pub const DEFAULT_RETAINED_RUNS: usize = 64;
/// Capacity used when the config does not bound resources.
pub const UNBOUNDED_CAPACITY: f64 = 1e9;

/// Orchestrator settings, read from `~/.wavefront/wavefront.toml`.
///
/// Every field has a default so a partial file (or none) is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Size of the worker pool.
    pub workers: usize,
    /// Total resources a single wave may claim.
    pub capacity: Resources,
    /// Relative change of the remaining critical path that triggers replanning.
    pub drift_threshold: f64,
    /// Upper bound of random extra backoff, as a fraction of the computed delay.
    pub retry_jitter: f64,
    /// How long cancelled handlers get to wind down before being force-marked.
    pub cancel_grace_ms: u64,
    /// Deadline for a whole run; `None` disables it.
    pub global_deadline_ms: Option<u64>,
    /// Maximum number of bottleneck tasks reported by the monitor.
    pub bottleneck_limit: usize,
    /// Finished graphs kept in memory; older ones are dropped on submit but
    /// stay resumable from their checkpoints.
    pub retained_runs: usize,
    /// Directory for checkpoints; defaults to `~/.wavefront/checkpoints`.
    pub checkpoint_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            capacity: Resources {
                cpu: UNBOUNDED_CAPACITY,
                mem: UNBOUNDED_CAPACITY,
            },
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            retry_jitter: DEFAULT_RETRY_JITTER,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            global_deadline_ms: None,
            bottleneck_limit: DEFAULT_BOTTLENECK_LIMIT,
            retained_runs: DEFAULT_RETAINED_RUNS,
            checkpoint_dir: None,
        }
    }
}

impl Config {
    pub fn wavefront_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".wavefront"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::wavefront_dir()?.join("wavefront.toml"))
    }

    pub fn checkpoints_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::wavefront_dir()?.join("checkpoints")),
        }
    }

    /// Worker count, never below one.
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn global_deadline(&self) -> Option<Duration> {
        self.global_deadline_ms.map(Duration::from_millis)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        wlog_debug!(
            "Config loaded: workers={}, capacity={:?}, drift_threshold={}",
            config.workers,
            config.capacity,
            config.drift_threshold
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::wavefront_dir()?;
        if !dir.exists() {
            wlog_debug!("Creating wavefront directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
