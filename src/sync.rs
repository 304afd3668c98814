//! Per-worker synchronization primitives: the admission gate and the handshake token.
//!
//! The dispatcher and a worker coordinate through two objects:
//!
//! - [`AdmissionGate`]: a binary gate the worker's executor blocks on. The dispatcher opens it
//!   once per dispatched unit; `stop()` opens it repeatedly. Opening an open gate does nothing.
//! - [`Handshake`]: a lock-guarded [`SlotState`] token. A dispatch policy moves it from
//!   `Idle` to `Reserved` while it holds the lock; the worker moves it to `Running` after it
//!   consumed the pending unit and back to `Idle` when the unit is done. While a slot is
//!   `Reserved` the policy treats the handshake as held by someone else and keeps spinning.

// Import fast mutex and condition variable for the gate and handshake
use parking_lot::{Condvar, Mutex, MutexGuard};

/// Binary admission signal. Starts closed.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate and wake the waiter, if any. Idempotent.
    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.opened.notify_one();
    }

    /// Block until the gate is open, then close it again.
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        *open = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

/// Ownership token carried by a worker's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Nobody holds the handshake; the slot may be reserved.
    #[default]
    Idle,
    /// A policy picked the worker; the worker has not consumed its unit yet.
    Reserved,
    /// The worker consumed the unit and is executing it.
    Running,
}

/// Lock guarding the [`SlotState`] of one worker.
#[derive(Debug, Default)]
pub struct Handshake {
    state: Mutex<SlotState>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    pub fn state(&self) -> SlotState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_starts_closed() {
        let gate = AdmissionGate::new();
        assert!(!gate.is_open());
    }

    #[test]
    fn double_open_is_single_permit() {
        let gate = AdmissionGate::new();
        gate.open();
        gate.open();
        gate.wait();
        assert!(!gate.is_open());
    }

    #[test]
    fn open_wakes_blocked_waiter() {
        let gate = Arc::new(AdmissionGate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(10));
        gate.open();
        waiter.join().unwrap();
        assert!(!gate.is_open());
    }

    #[test]
    fn handshake_defaults_to_idle() {
        let handshake = Handshake::new();
        assert_eq!(handshake.state(), SlotState::Idle);
        *handshake.lock() = SlotState::Reserved;
        assert_eq!(handshake.state(), SlotState::Reserved);
    }
}
