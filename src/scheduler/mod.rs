//! Central dispatcher.
//!
//! The [`Scheduler`] hands out execution permission one unit at a time. Each dispatch asks the
//! active [`DispatchPolicy`] for a reserved worker, marks that worker's core busy, and opens its
//! admission gate. The reservation is not released here: the worker releases it after it took
//! the pending unit, so the dispatcher can neither over-dispatch a worker nor dispatch it twice
//! before the first unit was acknowledged.

pub mod policy;

pub use policy::{fifo, round_robin, DispatchPolicy, PolicyFn};

// Import core pinning for the dispatcher thread
use crate::threading::{host_affinity, pin_or_warn, AffinityHandle};
// Import the dispatcher-side view of each worker
use crate::worker::WorkerLink;
use serde::Serialize;
use std::time::Instant;

/// Summary of one `schedule()` run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub policy: DispatchPolicy,
    pub dispatches: usize,
    /// Dispatch count per worker, in pipeline order.
    pub per_worker: Vec<usize>,
    pub elapsed_secs: f64,
}

pub struct Scheduler {
    workers: Vec<WorkerLink>,
    policy: DispatchPolicy,
    core_id: usize,
    cursor: usize,
    affinity: AffinityHandle,
}

impl Scheduler {
    /// Dispatcher over `workers` (pipeline order), pinned to `core_id` while scheduling.
    ///
    /// # Arguments
    /// * `workers` - Links to the pipeline's workers, first stage first
    /// * `policy` - Policy used by the next `schedule()` call
    /// * `core_id` - Core the calling thread is pinned to when scheduling starts
    pub fn new(workers: Vec<WorkerLink>, policy: DispatchPolicy, core_id: usize) -> Self {
        Self {
            workers,
            policy,
            core_id,
            cursor: 0,
            affinity: host_affinity(),
        }
    }

    pub fn with_affinity(mut self, affinity: AffinityHandle) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Swap the policy used by subsequent `schedule()` calls.
    pub fn change_policy(&mut self, policy: DispatchPolicy) {
        self.policy = policy;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn workers(&self) -> &[WorkerLink] {
        &self.workers
    }

    /// Units seeded across all workers times the number of stages: every seeded unit is
    /// dispatched once per stage as it cascades down the pipeline.
    ///
    /// # Returns
    /// The dispatch count, saturated at `usize::MAX` when it does not fit
    pub fn total_dispatches(&self) -> usize {
        let total = self
            .workers
            .iter()
            .map(WorkerLink::pending)
            .try_fold(0usize, usize::checked_add)
            .and_then(|seeded| seeded.checked_mul(self.workers.len()));
        total.unwrap_or_else(|| {
            tracing::warn!(
                workers = self.workers.len(),
                "dispatch total overflows usize, saturating"
            );
            usize::MAX
        })
    }

    /// Dispatch until the computed total is exhausted.
    ///
    /// Does not stop or join the workers; units dispatched last may still be executing when
    /// this returns.
    pub fn schedule(&mut self) -> DispatchReport {
        self.schedule_with(|_| {})
    }

    /// Like [`Scheduler::schedule`], calling `on_dispatch` with the worker index of every
    /// dispatch in order.
    pub fn schedule_with(&mut self, mut on_dispatch: impl FnMut(usize)) -> DispatchReport {
        pin_or_warn(self.affinity.as_ref(), self.core_id, "dispatcher");

        let total = self.total_dispatches();
        let mut per_worker = vec![0usize; self.workers.len()];
        tracing::info!(
            policy = %self.policy,
            workers = self.workers.len(),
            total,
            "scheduling started"
        );

        let started = Instant::now();
        let mut remaining = total;
        while remaining > 0 {
            let (cursor, reservation) = self.policy.select(&self.workers, self.cursor);
            self.cursor = cursor;
            let index = reservation.index();
            reservation.dispatch();
            remaining -= 1;

            per_worker[index] += 1;
            on_dispatch(index);
            tracing::debug!(worker = index, remaining, "unit dispatched");
        }

        let report = DispatchReport {
            policy: self.policy,
            dispatches: total,
            per_worker,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            policy = %report.policy,
            dispatches = report.dispatches,
            elapsed_secs = report.elapsed_secs,
            "scheduling finished"
        );
        report
    }
}
