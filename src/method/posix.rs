//! POSIX AIO method.
//!
//! Each handle owns a stable `aiocb` slot for its lifetime, so submission
//! is a matter of filling the block and calling `aio_read`/`aio_write`/
//! `aio_fsync`. POSIX AIO has no vectored entry point, so multi-segment
//! operations (and flush hints, and no-ops) are declared synchronous and
//! run inline at define time.
//!
//! Any waiter may notice completion first; `aio_return` must be called
//! exactly once, so reapers race through [`StateCell::begin_reap`] and only
//! the winner consumes the kernel result.
//!
//! [`StateCell::begin_reap`]: crate::state::StateCell::begin_reap

use std::cell::UnsafeCell;
use std::ptr;

use crate::config::{EngineConfig, IoMethodKind};
use crate::engine::{Backend, EngineControl};
use crate::handle::OpData;
use crate::method::IoMethod;
use crate::ops;
use crate::state::{HandleState, Observed};

pub(crate) struct PosixAioMethod {
    /// One control block per handle, indexed by global handle index.
    cbs: Box<[UnsafeCell<libc::aiocb>]>,
}

// SAFETY: an aiocb slot is touched only by its handle's submitting backend
// (fill + enqueue) and by the reap winner (aio_return); the state machine
// orders the two.
unsafe impl Send for PosixAioMethod {}
unsafe impl Sync for PosixAioMethod {}

impl PosixAioMethod {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            cbs: (0..config.total_handles())
                // SAFETY: an all-zero aiocb is a valid "no request" block.
                .map(|_| UnsafeCell::new(unsafe { std::mem::zeroed() }))
                .collect(),
        }
    }

    /// Enqueues one in-flight handle with the kernel. Falls back to inline
    /// execution when the kernel rejects the request (EAGAIN).
    fn enqueue(&self, ctl: &EngineControl, backend: &mut Backend, index: u32) {
        // SAFETY: the method owns the in-flight handle; the cb slot is ours.
        let ret = unsafe {
            let op = *ctl.handle(index).op_data();
            let cb = &mut *self.cbs[index as usize].get();
            *cb = std::mem::zeroed();
            cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
            match op {
                OpData::Read { fd, offset, .. } => {
                    let iov = ctl.iovec_raw(index, 0);
                    cb.aio_fildes = fd;
                    cb.aio_offset = offset as libc::off_t;
                    cb.aio_buf = iov.iov_base;
                    cb.aio_nbytes = iov.iov_len;
                    libc::aio_read(cb)
                }
                OpData::Write { fd, offset, .. } => {
                    let iov = ctl.iovec_raw(index, 0);
                    cb.aio_fildes = fd;
                    cb.aio_offset = offset as libc::off_t;
                    cb.aio_buf = iov.iov_base;
                    cb.aio_nbytes = iov.iov_len;
                    libc::aio_write(cb)
                }
                OpData::Fsync { fd, datasync } => {
                    cb.aio_fildes = fd;
                    let op = if datasync { libc::O_DSYNC } else { libc::O_SYNC };
                    libc::aio_fsync(op, cb)
                }
                other => panic!("{} is synchronous under posix_aio", other.name()),
            }
        };

        if ret != 0 {
            // Kernel queue exhausted; do the work ourselves.
            tracing::debug!(io = index, "aio enqueue rejected, executing inline");
            ops::perform_synchronously(ctl, backend, index);
        }
    }
}

impl IoMethod for PosixAioMethod {
    fn kind(&self) -> IoMethodKind {
        IoMethodKind::PosixAio
    }

    fn submit(&self, backend: &mut Backend, staged: &[u32]) -> usize {
        let ctl = backend.control().clone();
        for &index in staged {
            ctl.prepare_submit(index);
        }
        for &index in staged {
            self.enqueue(&ctl, backend, index);
        }
        staged.len()
    }

    fn wait_one(&self, backend: &mut Backend, index: u32, ref_generation: u64) -> bool {
        let ctl = backend.control().clone();
        let cb = self.cbs[index as usize].get();

        loop {
            match ctl.handle(index).state.observe(ref_generation) {
                Observed::Recycled => return true,
                Observed::Live(HandleState::InFlight) => {}
                Observed::Live(_) => return true,
            }

            // SAFETY: the cb stays in place for the handle's lifetime; the
            // kernel treats it read-only after enqueue.
            let err = unsafe { libc::aio_error(cb) };
            if err == libc::EINPROGRESS {
                let list = [cb as *const libc::aiocb];
                // SAFETY: list entries are valid for the duration of the
                // call. EINTR just re-runs the loop.
                unsafe { libc::aio_suspend(list.as_ptr(), 1, ptr::null()) };
                continue;
            }

            if ctl.handle(index).state.begin_reap() {
                // SAFETY: reap winner; aio_return is called exactly once.
                let res = unsafe { libc::aio_return(cb as *mut libc::aiocb) };
                let raw = if err != 0 {
                    -err
                } else if res < 0 {
                    -libc::EIO
                } else {
                    res as i32
                };
                ctl.complete_reaped(Some(backend), index, raw, false);
            } else {
                // Another reaper is running the callback chain; the engine
                // condvar covers the rest of the wait.
                return false;
            }
            return true;
        }
    }

    fn needs_synchronous_execution(&self, ctl: &EngineControl, index: u32) -> bool {
        // SAFETY: called at define time by the issuing backend.
        let op = unsafe { *ctl.handle(index).op_data() };
        match op {
            OpData::Read { iov_count, .. } | OpData::Write { iov_count, .. } => iov_count > 1,
            OpData::Fsync { .. } => false,
            OpData::FlushRange { .. } | OpData::Nop | OpData::Invalid => true,
        }
    }
}
