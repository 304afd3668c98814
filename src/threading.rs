//! CPU affinity helpers shared by workers and the dispatcher.
//!
//! Pinning is best-effort: callers log failures and keep running unpinned. The capability is
//! exposed through the [`Affinity`] trait so tests and unsupported platforms can swap in
//! [`NoAffinity`].

use std::fmt;
// Import OS error reporting for failed pinning
use std::io;
use std::sync::Arc;

/// Capability to restrict the calling thread to a single CPU core.
pub trait Affinity: Send + Sync + fmt::Debug {
    /// Pin the current thread to `core_id`.
    fn pin_current(&self, core_id: usize) -> io::Result<()>;
}

/// Shared handle to an affinity implementation.
pub type AffinityHandle = Arc<dyn Affinity>;

/// Pins through the host OS API (`pthread_setaffinity_np` on Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsAffinity;

impl Affinity for OsAffinity {
    fn pin_current(&self, core_id: usize) -> io::Result<()> {
        set_thread_core(core_id)
    }
}

/// Accepts every request and leaves the thread where the OS put it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAffinity;

impl Affinity for NoAffinity {
    fn pin_current(&self, _core_id: usize) -> io::Result<()> {
        Ok(())
    }
}

/// Default capability for the host platform.
pub fn host_affinity() -> AffinityHandle {
    Arc::new(OsAffinity)
}

/// Pin the current thread to `core_id` and log (rather than fail) when the OS refuses.
///
/// # Arguments
/// * `affinity` - Pinning capability, usually [`host_affinity`]
/// * `core_id` - Target core
/// * `role` - Names the thread in the log line (`"dispatcher"`, a stage name, ...)
pub fn pin_or_warn(affinity: &dyn Affinity, core_id: usize, role: &str) {
    match affinity.pin_current(core_id) {
        Ok(()) => tracing::debug!(core = core_id, role, "thread pinned"),
        Err(err) => tracing::warn!(core = core_id, role, error = %err, "failed to pin thread"),
    }
}

/// Restrict the current thread to a specific core.
///
/// # Arguments
/// * `core_id` - Zero-based CPU core index
///
/// # Returns
/// `Ok(())` on success, or the OS error when the kernel refuses the mask
///
/// # Platform Support
/// - **Linux**: Uses `pthread_setaffinity_np`. Core ids beyond the kernel's `cpu_set_t`
///   capacity are rejected with `InvalidInput`, since `CPU_SET` would write out of bounds.
/// - **Other platforms**: No-op (returns `Ok(())`). macOS and Windows thread affinity is not
///   implemented.
#[cfg(target_os = "linux")]
pub fn set_thread_core(core_id: usize) -> io::Result<()> {
    use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};

    let capacity = std::mem::size_of::<cpu_set_t>() * 8;
    if core_id >= capacity {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {core_id} exceeds cpu_set_t capacity ({capacity})"),
        ));
    }

    let ret = unsafe {
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_core(core_id: usize) -> io::Result<()> {
    let _ = core_id;
    Ok(())
}
