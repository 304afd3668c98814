//! Pipeline assembly.
//!
//! [`PipelineBuilder`] turns an ordered list of stages into running workers: it checks the core
//! layout, wires each worker to the pending counter of the next one (last to first), starts the
//! executors and seeds the first stage. [`Pipeline::build`] does this for the fetch, statistics
//! and logger stages described by a [`PipelineConfig`].

use crate::busy::BusyTable;
// Import runtime configuration
use crate::config::{CommunicationMode, PipelineConfig, SharedCores};
// Import stage-to-stage connectors
use crate::connector::{Connector, SharedBuffer};
use crate::error::{ConfigError, PipelineError, WorkerFault};
use crate::latency::DEFAULT_SMOOTHING;
// Import the central dispatcher
use crate::scheduler::{DispatchPolicy, DispatchReport, Scheduler};
// Import the image-statistics stages
use crate::stages::{Fetcher, Logger, Statistics};
use crate::threading::{host_affinity, AffinityHandle};
// Import pinned workers and their dispatcher-side links
use crate::worker::{Stage, Worker, WorkerConfig, WorkerLink, WorkerStats, DEFAULT_STOP_BACKOFF};
use serde::Serialize;
use std::collections::HashMap;
// Import thread spawning for the dispatcher
use std::thread;
use std::time::{Duration, Instant};

struct StageEntry {
    name: String,
    core_id: usize,
    stage: Box<dyn Stage>,
}

/// Step-by-step construction of a [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<StageEntry>,
    seed: usize,
    dispatcher_core: usize,
    smoothing: f64,
    stop_backoff: Duration,
    shared_cores: SharedCores,
    affinity: AffinityHandle,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            seed: 0,
            dispatcher_core: 0,
            smoothing: DEFAULT_SMOOTHING,
            stop_backoff: DEFAULT_STOP_BACKOFF,
            shared_cores: SharedCores::default(),
            affinity: host_affinity(),
        }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage pinned to `core_id`. Stages run in the order they are added.
    pub fn stage(mut self, name: impl Into<String>, core_id: usize, stage: impl Stage) -> Self {
        self.stages.push(StageEntry {
            name: name.into(),
            core_id,
            stage: Box::new(stage),
        });
        self
    }

    /// Units of work initially pending on the first stage.
    pub fn seed(mut self, units: usize) -> Self {
        self.seed = units;
        self
    }

    pub fn dispatcher_core(mut self, core_id: usize) -> Self {
        self.dispatcher_core = core_id;
        self
    }

    pub fn smoothing(mut self, p: f64) -> Self {
        self.smoothing = p;
        self
    }

    pub fn stop_backoff(mut self, backoff: Duration) -> Self {
        self.stop_backoff = backoff;
        self
    }

    pub fn shared_cores(mut self, policy: SharedCores) -> Self {
        self.shared_cores = policy;
        self
    }

    /// Pinning capability for the workers and the dispatcher.
    pub fn affinity(mut self, affinity: AffinityHandle) -> Self {
        self.affinity = affinity;
        self
    }

    /// Validate the layout, construct and start every worker, then seed the first stage.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.check_shared_cores()?;
        let busy = BusyTable::for_cores(self.stages.iter().map(|entry| entry.core_id));

        let mut workers = Vec::with_capacity(self.stages.len());
        let mut downstream = None;
        for entry in self.stages.into_iter().rev() {
            let config = WorkerConfig {
                name: entry.name,
                core_id: entry.core_id,
                smoothing: self.smoothing,
                stop_backoff: self.stop_backoff,
                downstream: downstream.take(),
                affinity: self.affinity.clone(),
            };
            let worker = Worker::new(entry.stage, busy.clone(), config)?;
            downstream = Some(worker.pending_counter());
            workers.push(worker);
        }
        workers.reverse();

        for worker in &mut workers {
            worker.start()?;
        }
        if let Some(first) = workers.first() {
            first.pending_counter().seed(self.seed);
        }
        tracing::info!(
            stages = workers.len(),
            seeded = self.seed,
            busy_cells = busy.capacity(),
            "pipeline assembled"
        );

        Ok(Pipeline {
            workers,
            busy,
            dispatcher_core: self.dispatcher_core,
            affinity: self.affinity,
        })
    }

    fn check_shared_cores(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<usize, &str> = HashMap::new();
        for entry in &self.stages {
            let Some(first) = owners.get(&entry.core_id).copied() else {
                owners.insert(entry.core_id, &entry.name);
                continue;
            };
            match self.shared_cores {
                SharedCores::Reject => {
                    return Err(ConfigError::SharedCore {
                        core: entry.core_id,
                        first: first.to_string(),
                        second: entry.name.clone(),
                    })
                }
                SharedCores::Allow => tracing::warn!(
                    core = entry.core_id,
                    first = %first,
                    second = %entry.name,
                    "stages share a core and will serialize"
                ),
            }
        }
        Ok(())
    }
}

/// Result of a full run: dispatch summary plus per-worker statistics after shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dispatch: DispatchReport,
    pub workers: Vec<WorkerStats>,
    pub elapsed_secs: f64,
}

/// A chain of started workers and the busy table they share.
pub struct Pipeline {
    workers: Vec<Worker>,
    busy: BusyTable,
    dispatcher_core: usize,
    affinity: AffinityHandle,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Assemble the fetch, statistics and logger stages described by `config`.
    ///
    /// In buffer mode adjacent stages share in-memory buffers; in file mode they exchange
    /// per-unit files under `work_dir/cropped` and `work_dir/stats`.
    ///
    /// # Returns
    /// A started pipeline whose fetcher is seeded with one unit per discovered input, or a
    /// [`PipelineError::Config`] for an unreadable input directory, an unknown statistic or
    /// an invalid core layout
    pub fn build(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Self::build_with_affinity(config, host_affinity())
    }

    pub fn build_with_affinity(
        config: &PipelineConfig,
        affinity: AffinityHandle,
    ) -> Result<Self, PipelineError> {
        let (samples, records, cropped, stats_dir) = match config.mode {
            CommunicationMode::Buffers => {
                (Some(SharedBuffer::new()), Some(SharedBuffer::new()), None, None)
            }
            CommunicationMode::Files => {
                (None, None, Some(config.cropped_dir()), Some(config.stats_dir()))
            }
        };
        let fetch_out =
            Connector::from_parts("fetcher", "output", samples.clone(), cropped.clone())?;
        let stats_in = Connector::from_parts("statistics", "input", samples, cropped)?;
        let stats_out =
            Connector::from_parts("statistics", "output", records.clone(), stats_dir.clone())?;
        let log_in = Connector::from_parts("logger", "input", records, stats_dir)?;

        let fetcher = Fetcher::new(&config.input_dir, config.background, fetch_out)?;
        let seed = fetcher.len();
        let statistics = Statistics::new(&config.statistics, stats_in, stats_out)?;
        let logger = Logger::new(log_in, config.output_file.clone(), config.verbose);
        let cores = config.cores;

        Pipeline::builder()
            .stage("fetcher", cores.fetcher, fetcher)
            .stage("statistics", cores.statistics, statistics)
            .stage("logger", cores.logger, logger)
            .seed(seed)
            .dispatcher_core(cores.dispatcher)
            .smoothing(config.smoothing)
            .stop_backoff(config.stop_backoff())
            .shared_cores(config.shared_cores)
            .affinity(affinity)
            .build()
    }

    /// Build, schedule with the configured policy, and stop.
    pub fn run(config: &PipelineConfig) -> Result<RunReport, PipelineError> {
        Self::run_with_affinity(config, host_affinity())
    }

    pub fn run_with_affinity(
        config: &PipelineConfig,
        affinity: AffinityHandle,
    ) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut pipeline = Self::build_with_affinity(config, affinity)?;
        let dispatch = pipeline.schedule(config.policy)?;
        pipeline.stop()?;
        Ok(RunReport {
            dispatch,
            workers: pipeline.stats(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn links(&self) -> Vec<WorkerLink> {
        self.workers.iter().map(Worker::link).collect()
    }

    pub fn busy_table(&self) -> &BusyTable {
        &self.busy
    }

    /// Dispatcher over this pipeline's workers.
    pub fn scheduler(&self, policy: DispatchPolicy) -> Scheduler {
        Scheduler::new(self.links(), policy, self.dispatcher_core)
            .with_affinity(self.affinity.clone())
    }

    /// Run the dispatcher to completion on a dedicated thread pinned to the dispatcher core.
    ///
    /// # Arguments
    /// * `policy` - Worker selection policy for this run
    ///
    /// # Returns
    /// The dispatch report, or [`PipelineError::SchedulerThread`] if the thread cannot be spawned
    pub fn schedule(&self, policy: DispatchPolicy) -> Result<DispatchReport, PipelineError> {
        let mut scheduler = self.scheduler(policy);
        let handle = thread::Builder::new()
            .name("Dispatcher".to_string())
            .spawn(move || scheduler.schedule())
            .map_err(PipelineError::SchedulerThread)?;
        match handle.join() {
            Ok(report) => Ok(report),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(Worker::stats).collect()
    }

    /// Drain in-flight units, then stop and join every worker in pipeline order.
    ///
    /// All workers are stopped even if one of them faulted; the first fault is returned.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        for worker in &self.workers {
            worker.wait_idle();
        }

        let mut first_fault: Option<WorkerFault> = None;
        for worker in &mut self.workers {
            if let Err(fault) = worker.shutdown() {
                tracing::error!(
                    stage = %worker.name(),
                    core = fault.core(),
                    error = %fault,
                    "worker fault"
                );
                first_fault.get_or_insert(fault);
            }
        }
        match first_fault {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }
}
