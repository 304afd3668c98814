//! Pipeline-stage worker: one executor thread pinned to one core.
//!
//! A [`Worker`] wraps a [`Stage`] and owns the state the dispatcher needs to hand it units of
//! work: a pending counter, an admission gate, a handshake token, and its cell in the shared
//! [`BusyTable`]. The dispatcher only ever sees a [`WorkerLink`], a cheap shared view of that
//! state.
//!
//! Executor state machine:
//!
//! ```text
//!   Waiting --gate opened, running--> Running --unit done--> Waiting
//!      |
//!      +--gate opened, stop requested--> ShuttingDown --cleanup--> Terminated
//! ```
//!
//! Handshake ownership: a policy reserves the worker (`Idle -> Reserved`) and the dispatcher
//! opens the gate without releasing the reservation. The executor takes one pending unit and
//! flips the token to `Running` itself; that is the moment the dispatcher may look at this
//! worker again. When the unit is done the executor clears the busy cell and returns the token
//! to `Idle` under the same lock.

// Import the per-core busy flags shared with the dispatcher
use crate::busy::BusyTable;
use crate::error::{ConfigError, StageError, WorkerFault};
// Import the execution time estimator
use crate::latency::{EtaEstimator, DEFAULT_SMOOTHING};
// Import pending-unit counters linking adjacent stages
use crate::pending::PendingCounter;
// Import the admission gate and dispatch handshake
use crate::sync::{AdmissionGate, Handshake, SlotState};
// Import CPU pinning for executor threads
use crate::threading::{host_affinity, pin_or_warn, AffinityHandle};
// Import fast mutex for the boxed stage
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
// Import atomics for lock-free phase and statistics updates
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
// Import thread spawning for the executor
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Delay between repeated admission releases while `stop()` waits for termination.
pub const DEFAULT_STOP_BACKOFF: Duration = Duration::from_millis(500);

/// Unit of work executed by a worker, once per dispatched unit.
///
/// Implementations read from their input connector and write to their output connector. They
/// must not touch the worker's pending counter or busy flag. An `Err` from [`Stage::run`] is
/// fatal to the worker: the executor exits and the stage is never called again.
pub trait Stage: Send + 'static {
    fn run(&mut self) -> Result<(), StageError>;

    /// Called once on the executor thread after a stop request is observed.
    fn clean(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn run(&mut self) -> Result<(), StageError> {
        (**self).run()
    }

    fn clean(&mut self) -> Result<(), StageError> {
        (**self).clean()
    }
}

/// [`Stage`] backed by a closure.
pub struct FnStage<F> {
    f: F,
}

/// Wrap a closure as a [`Stage`] with a no-op cleanup hook.
pub fn stage_fn<F>(f: F) -> FnStage<F>
where
    F: FnMut() -> Result<(), StageError> + Send + 'static,
{
    FnStage { f }
}

impl<F> Stage for FnStage<F>
where
    F: FnMut() -> Result<(), StageError> + Send + 'static,
{
    fn run(&mut self) -> Result<(), StageError> {
        (self.f)()
    }
}

/// Observable phase of a worker's executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerPhase {
    /// Constructed, executor not spawned yet.
    Created = 0,
    Waiting = 1,
    Running = 2,
    ShuttingDown = 3,
    Terminated = 4,
    /// The executor exited because its stage failed.
    Faulted = 5,
}

impl WorkerPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerPhase::Waiting,
            2 => WorkerPhase::Running,
            3 => WorkerPhase::ShuttingDown,
            4 => WorkerPhase::Terminated,
            5 => WorkerPhase::Faulted,
            _ => WorkerPhase::Created,
        }
    }
}

/// Construction parameters for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stage name used in thread names, logs and faults.
    pub name: String,
    /// Core the executor is pinned to; also the worker's busy-table key.
    pub core_id: usize,
    /// EMA smoothing factor, `0 < p <= 1`.
    pub smoothing: f64,
    /// Backoff between admission releases after the first one in `stop()`.
    pub stop_backoff: Duration,
    /// Pending counter of the next stage, incremented after each completed unit.
    pub downstream: Option<PendingCounter>,
    /// Pinning capability used by the executor thread.
    pub affinity: AffinityHandle,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            core_id: 0,
            smoothing: DEFAULT_SMOOTHING,
            stop_backoff: DEFAULT_STOP_BACKOFF,
            downstream: None,
            affinity: host_affinity(),
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, core_id: usize) -> Self {
        Self {
            name: name.into(),
            core_id,
            ..Self::default()
        }
    }
}

/// Point-in-time view of a worker, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub name: String,
    pub core_id: usize,
    pub phase: WorkerPhase,
    pub pending: usize,
    pub busy: bool,
    pub completed: u64,
    pub eta_secs: Option<f64>,
}

#[derive(Debug)]
struct WorkerShared {
    name: String,
    core_id: usize,
    pending: PendingCounter,
    busy: BusyTable,
    gate: AdmissionGate,
    handshake: Handshake,
    running: AtomicBool,
    terminated: AtomicBool,
    phase: AtomicU8,
    completed: AtomicU64,
    eta: Mutex<EtaEstimator>,
}

impl WorkerShared {
    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Executor run loop. Returns `Ok` only after a clean, requested shutdown.
    fn run(
        &self,
        mut stage: Box<dyn Stage>,
        downstream: Option<&PendingCounter>,
    ) -> Result<(), WorkerFault> {
        loop {
            self.set_phase(WorkerPhase::Waiting);
            self.gate.wait();

            if !self.running.load(Ordering::Acquire) {
                self.set_phase(WorkerPhase::ShuttingDown);
                let cleaned = stage.clean().map_err(|source| WorkerFault::Cleanup {
                    stage: self.name.clone(),
                    core: self.core_id,
                    source,
                });
                self.terminated.store(true, Ordering::Release);
                self.set_phase(WorkerPhase::Terminated);
                tracing::info!(
                    stage = %self.name,
                    core = self.core_id,
                    completed = self.completed.load(Ordering::Relaxed),
                    "worker terminated"
                );
                return cleaned;
            }

            self.acknowledge()?;
            self.set_phase(WorkerPhase::Running);

            let started = Instant::now();
            stage.run().map_err(|source| WorkerFault::Stage {
                stage: self.name.clone(),
                core: self.core_id,
                source,
            })?;
            let elapsed = started.elapsed();

            if let Some(next) = downstream {
                next.increment();
            }
            let eta = self.eta.lock().observe(elapsed);
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.release();

            tracing::debug!(
                stage = %self.name,
                core = self.core_id,
                elapsed_us = elapsed.as_micros() as u64,
                eta_secs = eta,
                "unit complete"
            );
        }
    }

    /// Consume the reserved unit and hand the handshake back (`Reserved -> Running`).
    fn acknowledge(&self) -> Result<(), WorkerFault> {
        let mut state = self.handshake.lock();
        if !self.pending.take_one() {
            return Err(WorkerFault::PendingUnderflow {
                stage: self.name.clone(),
                core: self.core_id,
            });
        }
        *state = SlotState::Running;
        Ok(())
    }

    /// Mark the unit finished: clear the busy cell and return to `Idle`.
    fn release(&self) {
        let mut state = self.handshake.lock();
        self.busy.clear(self.core_id);
        *state = SlotState::Idle;
    }
}

/// Shared handle to a worker's dispatch-visible state.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    shared: Arc<WorkerShared>,
}

impl WorkerLink {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn core_id(&self) -> usize {
        self.shared.core_id
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.get()
    }

    /// Counter an upstream stage (or the assembler) uses to add work.
    pub fn pending_counter(&self) -> PendingCounter {
        self.shared.pending.clone()
    }

    /// Busy-table cell for this worker's core.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.is_busy(self.shared.core_id)
    }

    pub fn slot_state(&self) -> SlotState {
        self.shared.handshake.state()
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn eta(&self) -> Option<f64> {
        self.shared.eta.lock().eta()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            name: self.shared.name.clone(),
            core_id: self.shared.core_id,
            phase: self.phase(),
            pending: self.pending(),
            busy: self.is_busy(),
            completed: self.completed(),
            eta_secs: self.eta(),
        }
    }

    /// Inspect the worker under its handshake lock and reserve it when it can take a unit.
    ///
    /// `index` is the worker's position in the dispatcher's list and is carried by the
    /// returned reservation.
    pub(crate) fn availability(&self, index: usize) -> Availability<'_> {
        let mut state = self.shared.handshake.lock();
        if *state == SlotState::Reserved {
            return Availability::Held;
        }
        if self.shared.pending.get() == 0 {
            return Availability::Empty;
        }
        if self.is_busy() {
            return Availability::Busy;
        }
        *state = SlotState::Reserved;
        Availability::Ready(Reservation {
            link: self,
            index,
            armed: true,
        })
    }
}

/// Result of checking one worker for dispatch.
pub(crate) enum Availability<'a> {
    /// Reserved by an earlier dispatch the worker has not acknowledged yet.
    Held,
    /// Nothing pending.
    Empty,
    /// Work pending but a unit is executing on the worker's core.
    Busy,
    /// Reserved for the caller.
    Ready(Reservation<'a>),
}

/// A worker picked by a dispatch policy, holding its handshake.
///
/// [`Reservation::dispatch`] hands the unit over and leaves the handshake for the worker to
/// release. Dropping an undispatched reservation returns the worker to `Idle`.
#[must_use = "a reservation holds the worker's handshake until dispatched or dropped"]
#[derive(Debug)]
pub struct Reservation<'a> {
    link: &'a WorkerLink,
    index: usize,
    armed: bool,
}

impl<'a> Reservation<'a> {
    pub fn worker(&self) -> &'a WorkerLink {
        self.link
    }

    /// Position of the reserved worker in the list the policy scanned.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Mark the worker's core busy and open its admission gate.
    pub fn dispatch(mut self) {
        let shared = &self.link.shared;
        shared.busy.mark(shared.core_id);
        shared.gate.open();
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.link.shared.handshake.lock();
            if *state == SlotState::Reserved {
                *state = SlotState::Idle;
            }
        }
    }
}

/// Owning handle to one pipeline stage and its executor thread.
pub struct Worker {
    link: WorkerLink,
    stop_backoff: Duration,
    affinity: AffinityHandle,
    downstream: Option<PendingCounter>,
    stage: Option<Box<dyn Stage>>,
    handle: Option<JoinHandle<Result<(), WorkerFault>>>,
}

impl Worker {
    /// Validate `config` and build a worker whose executor is not running yet.
    ///
    /// # Arguments
    /// * `stage` - Unit of work run once per admitted unit
    /// * `busy` - Busy table shared by every worker and the dispatcher
    /// * `config` - Name, core, smoothing, stop backoff and downstream counter
    ///
    /// # Returns
    /// [`ConfigError::CoreOutOfRange`] when the core has no busy cell, or
    /// [`ConfigError::SmoothingFactor`] when the smoothing factor is outside `(0, 1]`
    pub fn new(
        stage: impl Stage,
        busy: BusyTable,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError> {
        busy.check(config.core_id)?;
        let eta = EtaEstimator::new(config.smoothing)?;

        let shared = WorkerShared {
            name: config.name,
            core_id: config.core_id,
            pending: PendingCounter::new(),
            busy,
            gate: AdmissionGate::new(),
            handshake: Handshake::new(),
            running: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            phase: AtomicU8::new(WorkerPhase::Created as u8),
            completed: AtomicU64::new(0),
            eta: Mutex::new(eta),
        };

        Ok(Self {
            link: WorkerLink {
                shared: Arc::new(shared),
            },
            stop_backoff: config.stop_backoff,
            affinity: config.affinity,
            downstream: config.downstream,
            stage: Some(Box::new(stage)),
            handle: None,
        })
    }

    /// Spawn the executor thread, pinned to the worker's core. Starting twice is a no-op.
    ///
    /// # Platform Support
    /// Pinning goes through the configured [`Affinity`](crate::threading::Affinity); on
    /// platforms without per-thread affinity the executor runs unpinned.
    pub fn start(&mut self) -> Result<(), WorkerFault> {
        let Some(stage) = self.stage.take() else {
            return Ok(());
        };
        let shared = self.link.shared.clone();
        let affinity = self.affinity.clone();
        let downstream = self.downstream.clone();

        let handle = thread::Builder::new()
            .name(format!("Stage-{}", shared.name))
            .spawn(move || {
                pin_or_warn(affinity.as_ref(), shared.core_id, &shared.name);
                let result = shared.run(stage, downstream.as_ref());
                if let Err(fault) = &result {
                    shared.set_phase(WorkerPhase::Faulted);
                    tracing::error!(
                        stage = %shared.name,
                        core = shared.core_id,
                        error = %fault,
                        "worker halted"
                    );
                }
                result
            })
            .map_err(|source| WorkerFault::Spawn {
                stage: self.link.name().to_string(),
                core: self.link.core_id(),
                source,
            })?;

        tracing::info!(stage = %self.link.name(), core = self.link.core_id(), "worker started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Request a cooperative shutdown and wait until the executor acknowledges it.
    ///
    /// Re-opens the admission gate until the executor reports termination, immediately on the
    /// first attempt and after `stop_backoff` on each later one. A unit already executing
    /// finishes first. Polling also ends if the executor has exited for another reason (or was
    /// never started); [`Worker::join`] reports why. Returns the number of release attempts.
    pub fn stop(&self) -> u32 {
        let shared = &self.link.shared;
        shared.running.store(false, Ordering::Release);

        let mut attempts = 0u32;
        while !shared.terminated.load(Ordering::Acquire) {
            if self.executor_exited() {
                break;
            }
            shared.gate.open();
            if attempts > 0 {
                thread::sleep(self.stop_backoff);
            }
            attempts += 1;
        }
        tracing::debug!(stage = %shared.name, core = shared.core_id, attempts, "stop observed");
        attempts
    }

    /// Wait for the executor thread and report how it ended.
    ///
    /// # Returns
    /// The stage or cleanup fault the executor halted with, or [`WorkerFault::Panicked`] when
    /// the stage panicked. A panicked worker is left in [`WorkerPhase::Faulted`].
    pub fn join(&mut self) -> Result<(), WorkerFault> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(payload) => {
                // The executor unwound past its own phase updates.
                self.link.shared.set_phase(WorkerPhase::Faulted);
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    stage = %self.link.name(),
                    core = self.link.core_id(),
                    %message,
                    "executor panicked"
                );
                Err(WorkerFault::Panicked {
                    stage: self.link.name().to_string(),
                    core: self.link.core_id(),
                    message,
                })
            }
        }
    }

    /// `stop()` followed by `join()`.
    pub fn shutdown(&mut self) -> Result<(), WorkerFault> {
        self.stop();
        self.join()
    }

    /// Spin until no unit is reserved for or executing on this worker.
    ///
    /// Returns early if the executor has exited, since a halted worker never drains.
    pub fn wait_idle(&self) {
        while self.link.slot_state() != SlotState::Idle {
            if self.executor_exited() {
                return;
            }
            thread::yield_now();
        }
    }

    fn executor_exited(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn link(&self) -> WorkerLink {
        self.link.clone()
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn core_id(&self) -> usize {
        self.link.core_id()
    }

    pub fn pending_counter(&self) -> PendingCounter {
        self.link.pending_counter()
    }

    pub fn is_terminated(&self) -> bool {
        self.link.is_terminated()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.link.phase()
    }

    pub fn stats(&self) -> WorkerStats {
        self.link.stats()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(fault) = self.shutdown() {
                tracing::warn!(error = %fault, "worker fault observed while dropping");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
