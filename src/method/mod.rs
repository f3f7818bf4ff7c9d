//! Pluggable I/O methods.
//!
//! A method is the mechanism that turns prepared handles into kernel I/O:
//! inline syscalls, a worker-thread pool, io_uring rings, or POSIX AIO. The
//! engine binds exactly one method at construction and talks to it through
//! [`IoMethod`]; everything else about the handle lifecycle is method
//! agnostic.

use std::sync::Arc;

use crate::config::{EngineConfig, IoMethodKind};
use crate::engine::{Backend, EngineControl};

mod sync;
mod worker;

#[cfg(target_os = "linux")]
mod uring;

mod posix;

/// The submission/wait contract every method implements.
///
/// `submit` must move each staged handle to `InFlight` (with the release
/// ordering [`EngineControl::prepare_submit`] provides) in batch order, and
/// must neither allocate nor block for long: it is called from contexts
/// that forbid both. It returns the number of handles accepted, which is
/// all of them for every current method.
pub(crate) trait IoMethod: Send + Sync {
    fn kind(&self) -> IoMethodKind;

    /// Late initialization once the engine is fully constructed (worker
    /// methods spawn their threads here).
    fn start(&self, _ctl: &Arc<EngineControl>) {}

    fn submit(&self, backend: &mut Backend, staged: &[u32]) -> usize;

    /// Blocks until the referenced handle is at or past `Reaped`, or its
    /// generation advanced. Returns false when the method has no better
    /// mechanism than the engine's per-handle condition variable.
    fn wait_one(&self, _backend: &mut Backend, _index: u32, _ref_generation: u64) -> bool {
        false
    }

    /// True for operations this method cannot perform asynchronously; the
    /// engine then executes them inline at define time.
    fn needs_synchronous_execution(&self, _ctl: &EngineControl, _index: u32) -> bool {
        false
    }
}

/// Builds the method selected by the configuration.
pub(crate) fn create(config: &EngineConfig) -> Box<dyn IoMethod> {
    match config.io_method {
        IoMethodKind::Sync => Box::new(sync::SyncMethod),
        IoMethodKind::Worker => Box::new(worker::WorkerMethod::new(config)),
        #[cfg(target_os = "linux")]
        IoMethodKind::IoUring => Box::new(uring::UringMethod::new(config)),
        IoMethodKind::PosixAio => Box::new(posix::PosixAioMethod::new(config)),
    }
}
