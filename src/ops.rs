//! Operation encoding and synchronous execution.
//!
//! The `stage_*` methods are the define entry points: they encode the
//! operation payload and hand the token to [`Backend::stage`], which runs
//! prepare hooks and either stages the handle for batched submission or
//! executes inline when the bound method cannot do it asynchronously.

use std::os::unix::io::RawFd;

use crate::engine::{AcquiredHandle, Backend, EngineControl};
use crate::handle::OpData;

impl Backend {
    /// Defines a vectored read from `fd` at `offset` through the handle's
    /// first `iov_count` iovec slots.
    pub fn stage_readv(&mut self, ioh: AcquiredHandle, fd: RawFd, iov_count: u16, offset: u64) {
        debug_assert!(iov_count > 0);
        self.stage(
            ioh,
            OpData::Read {
                fd,
                offset,
                iov_count,
            },
        );
    }

    /// Defines a vectored write to `fd` at `offset`.
    pub fn stage_writev(&mut self, ioh: AcquiredHandle, fd: RawFd, iov_count: u16, offset: u64) {
        debug_assert!(iov_count > 0);
        self.stage(
            ioh,
            OpData::Write {
                fd,
                offset,
                iov_count,
            },
        );
    }

    /// Defines an fsync (or fdatasync) of `fd`.
    pub fn stage_fsync(&mut self, ioh: AcquiredHandle, fd: RawFd, datasync: bool) {
        self.stage(ioh, OpData::Fsync { fd, datasync });
    }

    /// Defines a kernel writeback hint for a file range.
    pub fn stage_flush_range(&mut self, ioh: AcquiredHandle, fd: RawFd, offset: u64, nbytes: u64) {
        self.stage(ioh, OpData::FlushRange { fd, offset, nbytes });
    }

    /// Defines a no-op; completes with result 0. Useful to order a batch.
    pub fn stage_nop(&mut self, ioh: AcquiredHandle) {
        self.stage(ioh, OpData::Nop);
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Performs the operation of an in-flight handle with plain syscalls.
///
/// Returns the raw result: the byte count, or the negated errno.
pub(crate) fn execute(ctl: &EngineControl, index: u32) -> i32 {
    // SAFETY: the executing party owns the handle in InFlight.
    let op = unsafe { *ctl.handle(index).op_data() };
    match op {
        OpData::Read {
            fd,
            offset,
            iov_count,
        } => {
            // SAFETY: iovec targets are valid per the staging contract.
            let res = unsafe {
                libc::preadv(
                    fd,
                    ctl.iovec_array_ptr(index),
                    iov_count as i32,
                    offset as libc::off_t,
                )
            };
            if res < 0 {
                -errno()
            } else {
                res as i32
            }
        }
        OpData::Write {
            fd,
            offset,
            iov_count,
        } => {
            // SAFETY: as for read.
            let res = unsafe {
                libc::pwritev(
                    fd,
                    ctl.iovec_array_ptr(index),
                    iov_count as i32,
                    offset as libc::off_t,
                )
            };
            if res < 0 {
                -errno()
            } else {
                res as i32
            }
        }
        OpData::Fsync { fd, datasync } => {
            // SAFETY: plain syscall on a descriptor the issuer owns.
            let res = unsafe {
                if datasync {
                    fdatasync(fd)
                } else {
                    libc::fsync(fd)
                }
            };
            if res < 0 {
                -errno()
            } else {
                0
            }
        }
        OpData::FlushRange { fd, offset, nbytes } => flush_range(fd, offset, nbytes),
        OpData::Nop => 0,
        OpData::Invalid => panic!("io:{index} executed without an operation"),
    }
}

/// Executes an in-flight handle inline on the issuing backend and drives it
/// to `CompletedLocal`.
pub(crate) fn perform_synchronously(ctl: &EngineControl, backend: &mut Backend, index: u32) {
    let raw = execute(ctl, index);
    let completed = ctl.process_completion(Some(backend), index, raw, true);
    debug_assert!(completed, "synchronous execution lost a reap race");
}

#[cfg(target_os = "linux")]
unsafe fn fdatasync(fd: RawFd) -> libc::c_int {
    libc::fdatasync(fd)
}

// Not all unix targets have fdatasync; full fsync is the conservative stand-in.
#[cfg(not(target_os = "linux"))]
unsafe fn fdatasync(fd: RawFd) -> libc::c_int {
    libc::fsync(fd)
}

#[cfg(target_os = "linux")]
fn flush_range(fd: RawFd, offset: u64, nbytes: u64) -> i32 {
    // SAFETY: plain syscall; a failure is reported, never fatal.
    let res = unsafe {
        libc::sync_file_range(
            fd,
            offset as libc::off64_t,
            nbytes as libc::off64_t,
            libc::SYNC_FILE_RANGE_WRITE,
        )
    };
    if res < 0 {
        -errno()
    } else {
        0
    }
}

#[cfg(not(target_os = "linux"))]
fn flush_range(fd: RawFd, _offset: u64, _nbytes: u64) -> i32 {
    // SAFETY: plain syscall; the whole-file sync over-satisfies the hint.
    let res = unsafe { fdatasync(fd) };
    if res < 0 {
        -errno()
    } else {
        0
    }
}
