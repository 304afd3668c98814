//! Runtime configuration for the image-statistics pipeline.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a runnable
//! configuration. The binary layers command-line overrides on top.

use crate::error::ConfigError;
use crate::latency::DEFAULT_SMOOTHING;
use crate::scheduler::DispatchPolicy;
use crate::stages::{Rgb, Statistic, DEFAULT_BACKGROUND};
use crate::worker::DEFAULT_STOP_BACKOFF;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How adjacent stages exchange units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationMode {
    /// In-memory shared buffers.
    #[default]
    Buffers,
    /// Per-unit files under the work directory.
    Files,
}

impl CommunicationMode {
    pub const ALL: [CommunicationMode; 2] = [CommunicationMode::Buffers, CommunicationMode::Files];
}

impl fmt::Display for CommunicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationMode::Buffers => write!(f, "buffers"),
            CommunicationMode::Files => write!(f, "files"),
        }
    }
}

impl FromStr for CommunicationMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "buffers" | "buffer" => Ok(CommunicationMode::Buffers),
            "files" | "file" => Ok(CommunicationMode::Files),
            _ => Err(ConfigError::UnknownMode(value.to_string())),
        }
    }
}

/// What to do when two stages are assigned the same core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedCores {
    /// Log a warning; the stages serialize through their shared busy cell.
    #[default]
    Allow,
    /// Fail assembly with [`ConfigError::SharedCore`].
    Reject,
}

/// Core assignment for the dispatcher and the three stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreAssignment {
    /// Core the dispatcher thread is pinned to.
    pub dispatcher: usize,
    pub fetcher: usize,
    pub statistics: usize,
    pub logger: usize,
}

impl Default for CoreAssignment {
    fn default() -> Self {
        Self {
            dispatcher: 0,
            fetcher: 1,
            statistics: 2,
            logger: 3,
        }
    }
}

impl CoreAssignment {
    /// Stage cores in pipeline order.
    pub fn stage_cores(&self) -> [usize; 3] {
        [self.fetcher, self.statistics, self.logger]
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: CommunicationMode,
    /// Directory scanned recursively for input images.
    pub input_dir: PathBuf,
    /// CSV file written by the logger on shutdown; `None` disables it.
    pub output_file: Option<PathBuf>,
    /// Parent of the intermediate `cropped/` and `stats/` directories in file mode.
    pub work_dir: PathBuf,
    pub cores: CoreAssignment,
    pub policy: DispatchPolicy,
    /// Statistic names computed per sample; see `stages::Statistic`.
    pub statistics: Vec<String>,
    /// Colour painted over fully transparent pixels; `None` keeps them as decoded.
    pub background: Option<Rgb>,
    /// EMA smoothing factor shared by all workers.
    pub smoothing: f64,
    pub stop_backoff_ms: u64,
    pub shared_cores: SharedCores,
    /// Log every record at `info` as the logger stage receives it.
    pub verbose: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: CommunicationMode::default(),
            input_dir: PathBuf::from("bin"),
            output_file: Some(PathBuf::from("results.csv")),
            work_dir: PathBuf::from("."),
            cores: CoreAssignment::default(),
            policy: DispatchPolicy::default(),
            statistics: Statistic::ALL
                .iter()
                .map(|stat| stat.as_str().to_string())
                .collect(),
            background: Some(DEFAULT_BACKGROUND),
            smoothing: DEFAULT_SMOOTHING,
            stop_backoff_ms: DEFAULT_STOP_BACKOFF.as_millis() as u64,
            shared_cores: SharedCores::default(),
            verbose: false,
        }
    }
}

impl PipelineConfig {
    /// Load a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn stop_backoff(&self) -> Duration {
        Duration::from_millis(self.stop_backoff_ms)
    }

    pub fn cropped_dir(&self) -> PathBuf {
        self.work_dir.join("cropped")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.work_dir.join("stats")
    }
}
