//! Dispatch policies.
//!
//! A policy is a selection function `(workers, cursor) -> (new_cursor, reservation)`. It checks
//! workers under their handshake locks and returns the first eligible one still reserved, so
//! the caller owns the handshake when the policy returns. Policies only read pending counts and
//! busy flags; they never change them.
//!
//! Both policies spin (no sleeping) until a worker becomes eligible.

use crate::error::ConfigError;
use crate::worker::{Availability, Reservation, WorkerLink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Signature shared by all selection functions.
pub type PolicyFn = for<'a> fn(&'a [WorkerLink], usize) -> (usize, Reservation<'a>);

/// Policy selector used by the scheduler and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Strict rotation; waits on the worker at the cursor until it is eligible.
    #[default]
    #[serde(alias = "round-robin", alias = "rr")]
    RoundRobin,
    /// Forward scan that skips empty workers and serves the first eligible one.
    Fifo,
}

impl DispatchPolicy {
    pub const ALL: [DispatchPolicy; 2] = [DispatchPolicy::RoundRobin, DispatchPolicy::Fifo];

    pub fn as_fn(self) -> PolicyFn {
        match self {
            DispatchPolicy::RoundRobin => round_robin,
            DispatchPolicy::Fifo => fifo,
        }
    }

    pub fn select<'a>(self, workers: &'a [WorkerLink], cursor: usize) -> (usize, Reservation<'a>) {
        (self.as_fn())(workers, cursor)
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DispatchPolicy::RoundRobin => "round_robin",
            DispatchPolicy::Fifo => "fifo",
        };
        write!(f, "{label}")
    }
}

impl FromStr for DispatchPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" | "rr" => Ok(DispatchPolicy::RoundRobin),
            "fifo" => Ok(DispatchPolicy::Fifo),
            _ => Err(ConfigError::UnknownPolicy(value.to_string())),
        }
    }
}

/// Round-robin selection.
///
/// Spins on `workers[cursor]` until it has pending work and its core is not busy, then returns
/// it reserved with the cursor advanced by one. A worker that never becomes eligible stalls the
/// rotation.
///
/// # Panics
/// Panics if `cursor` is out of bounds for `workers`.
pub fn round_robin(workers: &[WorkerLink], cursor: usize) -> (usize, Reservation<'_>) {
    let worker = &workers[cursor];
    loop {
        match worker.availability(cursor) {
            Availability::Ready(reservation) => return ((cursor + 1) % workers.len(), reservation),
            Availability::Held | Availability::Empty | Availability::Busy => std::hint::spin_loop(),
        }
    }
}

/// FIFO-scan selection.
///
/// Moves the cursor past workers with nothing pending, spins on a worker that has work but is
/// busy (or still reserved), and returns the first eligible worker reserved. The cursor is left
/// on the chosen worker so it keeps being served while it has work.
///
/// # Panics
/// Panics if `cursor` is out of bounds for `workers`.
pub fn fifo(workers: &[WorkerLink], mut cursor: usize) -> (usize, Reservation<'_>) {
    loop {
        match workers[cursor].availability(cursor) {
            Availability::Ready(reservation) => return (cursor, reservation),
            Availability::Empty => cursor = (cursor + 1) % workers.len(),
            Availability::Held | Availability::Busy => std::hint::spin_loop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busy::BusyTable;
    use crate::threading::NoAffinity;
    use crate::worker::{stage_fn, Worker, WorkerConfig};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Unstarted workers on cores `0..pending.len()`, seeded with `pending`.
    fn workers(pending: &[usize]) -> (BusyTable, Vec<Worker>) {
        let busy = BusyTable::new(pending.len());
        let workers = pending
            .iter()
            .enumerate()
            .map(|(core, &units)| {
                let cfg = WorkerConfig {
                    affinity: Arc::new(NoAffinity),
                    ..WorkerConfig::new(format!("w{core}"), core)
                };
                let worker = Worker::new(stage_fn(|| Ok(())), busy.clone(), cfg).unwrap();
                worker.pending_counter().seed(units);
                worker
            })
            .collect();
        (busy, workers)
    }

    fn links(workers: &[Worker]) -> Vec<WorkerLink> {
        workers.iter().map(Worker::link).collect()
    }

    #[test]
    fn parses_known_policies() {
        assert_eq!("rr".parse::<DispatchPolicy>().unwrap(), DispatchPolicy::RoundRobin);
        assert_eq!("FIFO".parse::<DispatchPolicy>().unwrap(), DispatchPolicy::Fifo);
        assert!(matches!(
            "lottery".parse::<DispatchPolicy>(),
            Err(ConfigError::UnknownPolicy(name)) if name == "lottery"
        ));
    }

    #[test]
    fn round_robin_advances_cursor_after_choice() {
        let (_busy, workers) = workers(&[1, 1, 1]);
        let links = links(&workers);

        let (cursor, reservation) = round_robin(&links, 2);
        assert_eq!(reservation.index(), 2);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn round_robin_waits_on_cursor_worker() {
        let (_busy, workers) = workers(&[0, 3]);
        let links = links(&workers);
        let (tx, rx) = crossbeam_channel::bounded(1);

        thread::scope(|scope| {
            scope.spawn(|| {
                let (_, reservation) = round_robin(&links, 0);
                tx.send(reservation.index()).unwrap();
            });

            // Worker 1 is eligible, but the rotation is parked on worker 0.
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            links[0].pending_counter().seed(1);
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        });
    }

    #[test]
    fn fifo_skips_empty_workers() {
        let (_busy, workers) = workers(&[0, 2, 1]);
        let links = links(&workers);

        let (cursor, reservation) = fifo(&links, 0);
        assert_eq!(reservation.index(), 1);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn fifo_wraps_to_lowest_pending_index() {
        let (_busy, workers) = workers(&[2, 0, 0]);
        let links = links(&workers);

        let (cursor, reservation) = fifo(&links, 1);
        assert_eq!(reservation.index(), 0);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn fifo_spins_on_busy_worker_with_work() {
        let (busy, workers) = workers(&[1, 1]);
        let links = links(&workers);
        busy.mark(0);
        let (tx, rx) = crossbeam_channel::bounded(1);

        thread::scope(|scope| {
            scope.spawn(|| {
                let (_, reservation) = fifo(&links, 0);
                tx.send(reservation.index()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            busy.clear(0);
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        });
    }

    #[test]
    fn selection_leaves_counters_untouched() {
        let (busy, workers) = workers(&[2, 1]);
        let links = links(&workers);

        for policy in DispatchPolicy::ALL {
            let (_, reservation) = policy.select(&links, 0);
            drop(reservation);
        }
        assert_eq!(links[0].pending(), 2);
        assert_eq!(links[1].pending(), 1);
        assert!(!busy.is_busy(0));
        assert!(!busy.is_busy(1));
    }
}
