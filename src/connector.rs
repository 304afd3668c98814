//! Connectors carrying units between adjacent stages.
//!
//! Each side of a stage is wired either to an in-memory [`SharedBuffer`] or to a directory in
//! which unit `i` lives at a file named after `i`. The two are mutually exclusive, which the
//! [`Connector`] enum encodes directly.

use crate::error::ConfigError;
// Import unbounded channels backing the in-memory buffers
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Unbounded FIFO shared between a producing and a consuming stage.
///
/// Clones refer to the same queue.
pub struct SharedBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> SharedBuffer<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // The buffer owns a receiver, so the channel is never disconnected.
        let _ = self.tx.send(item);
    }

    /// Oldest queued item, if any.
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for SharedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len()).finish()
    }
}

/// One side of a stage: a shared buffer or a directory of per-unit files.
#[derive(Debug, Clone)]
pub enum Connector<T> {
    Buffer(SharedBuffer<T>),
    Path(PathBuf),
}

impl<T> Connector<T> {
    /// Build a connector from optional parts, rejecting none or both.
    ///
    /// # Arguments
    /// * `stage` - Stage owning this side, for error reporting
    /// * `side` - `"input"` or `"output"`
    /// * `buffer` - Shared buffer, set in buffer mode
    /// * `path` - Unit directory, set in file mode
    ///
    /// # Returns
    /// The connector, or [`ConfigError::MissingConnector`] / [`ConfigError::ConflictingConnector`]
    pub fn from_parts(
        stage: &str,
        side: &'static str,
        buffer: Option<SharedBuffer<T>>,
        path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        match (buffer, path) {
            (Some(buffer), None) => Ok(Connector::Buffer(buffer)),
            (None, Some(path)) => Ok(Connector::Path(path)),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingConnector {
                stage: stage.to_string(),
                side,
            }),
            (None, None) => Err(ConfigError::MissingConnector {
                stage: stage.to_string(),
                side,
            }),
        }
    }

    /// Create the directory behind an output path connector.
    pub fn prepare_output(&self) -> Result<(), ConfigError> {
        match self {
            Connector::Buffer(_) => Ok(()),
            Connector::Path(path) => prepare_output_dir(path),
        }
    }
}

/// `<dir>/<index>.<extension>`, the file backing unit `index` on a path connector.
pub fn unit_path(dir: &Path, index: usize, extension: &str) -> PathBuf {
    dir.join(format!("{index}.{extension}"))
}

pub fn prepare_output_dir(path: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(path).map_err(|source| ConfigError::OutputDir {
        path: path.to_path_buf(),
        source,
    })
}
