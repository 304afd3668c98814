//! CPU-pinned pipeline stages driven by a central dispatcher.
//!
//! Each stage runs on a [`Worker`] whose executor thread is pinned to one core. A
//! [`Scheduler`] hands out one unit of work at a time, choosing the target with a
//! [`DispatchPolicy`] and guarding every core with a shared [`BusyTable`] so no two units
//! execute on the same core at once.

pub mod busy;
pub mod config;
pub mod connector;
pub mod error;
pub mod latency;
pub mod pending;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod sweep;
pub mod sync;
pub mod threading;
pub mod worker;

pub use busy::BusyTable;
pub use config::{CommunicationMode, CoreAssignment, PipelineConfig, SharedCores};
pub use connector::{Connector, SharedBuffer};
pub use error::{ConfigError, PipelineError, StageError, WorkerFault};
pub use latency::EtaEstimator;
pub use pending::PendingCounter;
pub use pipeline::{Pipeline, PipelineBuilder, RunReport};
pub use scheduler::{DispatchPolicy, DispatchReport, Scheduler};
pub use sync::SlotState;
pub use worker::{stage_fn, Stage, Worker, WorkerConfig, WorkerLink, WorkerPhase, WorkerStats};
