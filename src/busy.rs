//! Cross-worker busy table keyed by CPU core id.
//!
//! Each core owns one cache-padded atomic cell, so readers and writers on different cores never
//! contend on a shared lock. The dispatcher sets a cell when it hands a unit to the worker
//! pinned to that core; the worker clears it once the unit is done.

use crate::error::ConfigError;
// Import cache-line padding so neighbouring cores do not share a line
use crossbeam_utils::CachePadded;
// Import lock-free flags for per-core occupancy
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, cloneable view of the per-core busy flags.
#[derive(Debug, Clone)]
pub struct BusyTable {
    cells: Arc<[CachePadded<AtomicBool>]>,
}

impl BusyTable {
    /// Table with one cell for every core id in `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        let cells: Vec<CachePadded<AtomicBool>> = (0..capacity)
            .map(|_| CachePadded::new(AtomicBool::new(false)))
            .collect();
        Self {
            cells: cells.into(),
        }
    }

    /// Table large enough for every id in `cores`.
    pub fn for_cores(cores: impl IntoIterator<Item = usize>) -> Self {
        let capacity = cores.into_iter().max().map_or(0, |max| max + 1);
        Self::new(capacity)
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Reject core ids that have no cell.
    pub fn check(&self, core: usize) -> Result<(), ConfigError> {
        if core < self.cells.len() {
            Ok(())
        } else {
            Err(ConfigError::CoreOutOfRange {
                core,
                capacity: self.cells.len(),
            })
        }
    }

    pub fn is_busy(&self, core: usize) -> bool {
        self.cells[core].load(Ordering::Acquire)
    }

    pub(crate) fn mark(&self, core: usize) {
        self.cells[core].store(true, Ordering::Release);
    }

    pub(crate) fn clear(&self, core: usize) {
        self.cells[core].store(false, Ordering::Release);
    }
}
