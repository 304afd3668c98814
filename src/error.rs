//! Error types shared by the worker, scheduler, and pipeline assembler.
//!
//! Configuration problems are reported when a component is constructed, never on first use.
//! Failures raised by a stage's work function end up in a [`WorkerFault`] tagged with the core
//! the failing worker was pinned to.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Construction-time validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized dispatch policy: {0}")]
    UnknownPolicy(String),

    #[error("unrecognized communication mode: {0}")]
    UnknownMode(String),

    #[error("unrecognized statistic: {0}")]
    UnknownStatistic(String),

    #[error("EMA smoothing factor must satisfy 0 < p <= 1, got {0}")]
    SmoothingFactor(f64),

    #[error("core {core} is outside the busy table (capacity {capacity})")]
    CoreOutOfRange { core: usize, capacity: usize },

    #[error("core {core} is assigned to both `{first}` and `{second}`")]
    SharedCore {
        core: usize,
        first: String,
        second: String,
    },

    #[error("{side} connector is missing for stage `{stage}`")]
    MissingConnector { stage: String, side: &'static str },

    #[error("stage `{stage}` was given both a buffer and a path as {side} connector")]
    ConflictingConnector { stage: String, side: &'static str },

    #[error("failed to scan input directory {path}: {source}")]
    InputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failure raised by a stage while processing one unit of work.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error on {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("input exhausted: {0}")]
    Exhausted(String),

    #[error("{0}")]
    Other(String),
}

impl StageError {
    /// Wrap an I/O failure with the file it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a decode or encode failure with the image it happened on.
    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        StageError::Image {
            path: path.into(),
            source,
        }
    }
}

/// Reason a worker executor stopped without reaching a clean shutdown.
#[derive(Debug, Error)]
pub enum WorkerFault {
    #[error("stage `{stage}` on core {core} failed: {source}")]
    Stage {
        stage: String,
        core: usize,
        #[source]
        source: StageError,
    },

    #[error("cleanup of stage `{stage}` on core {core} failed: {source}")]
    Cleanup {
        stage: String,
        core: usize,
        #[source]
        source: StageError,
    },

    #[error("stage `{stage}` on core {core} panicked: {message}")]
    Panicked {
        stage: String,
        core: usize,
        message: String,
    },

    #[error("stage `{stage}` on core {core} was woken with no pending work")]
    PendingUnderflow { stage: String, core: usize },

    #[error("failed to spawn executor for stage `{stage}` on core {core}: {source}")]
    Spawn {
        stage: String,
        core: usize,
        #[source]
        source: io::Error,
    },
}

impl WorkerFault {
    /// Core id of the worker that reported the fault.
    pub fn core(&self) -> usize {
        match self {
            WorkerFault::Stage { core, .. }
            | WorkerFault::Cleanup { core, .. }
            | WorkerFault::Panicked { core, .. }
            | WorkerFault::PendingUnderflow { core, .. }
            | WorkerFault::Spawn { core, .. } => *core,
        }
    }
}

/// Errors surfaced by the pipeline assembler and the experiment sweep.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Worker(#[from] WorkerFault),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn scheduler thread: {0}")]
    SchedulerThread(#[source] io::Error),
}
