//! io_uring method: one ring per backend, completions reaped by whichever
//! backend needs them first.
//!
//! Submission pushes SQEs that point straight into the shared iovec pool,
//! so the kernel reads the scatter list the issuer built; no per-operation
//! allocation or copying. Each ring is guarded by a mutex: the owning
//! backend submits under it, and any backend may drain completions under
//! it. `wait_one` re-checks the handle state after draining, while still
//! holding the lock, before it blocks — the CQE it waits for can only be
//! consumed by another lock holder, so the re-check makes lost-completion
//! blocking impossible.

use std::sync::{Arc, Mutex};

use io_uring::{opcode, types, IoUring};

use crate::config::{EngineConfig, IoMethodKind, SUBMIT_BATCH_SIZE};
use crate::engine::{Backend, EngineControl};
use crate::handle::OpData;
use crate::method::IoMethod;
use crate::state::{HandleState, Observed};

pub(crate) struct UringMethod {
    rings: Box<[Mutex<IoUring>]>,
}

impl UringMethod {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        let entries = (2 * config.io_max_concurrency.max(SUBMIT_BATCH_SIZE as u32))
            .next_power_of_two();
        let rings = (0..config.num_backends)
            .map(|_| Mutex::new(IoUring::new(entries).expect("create io_uring")))
            .collect();
        Self { rings }
    }

    /// Drains every available completion of `ring`, completing the handles.
    /// Returns the number of completions processed.
    fn drain(&self, ctl: &EngineControl, backend: &mut Backend, ring: &mut IoUring) -> usize {
        let mut processed = 0;
        loop {
            let Some(cqe) = ring.completion().next() else {
                break;
            };
            let index = cqe.user_data() as u32;
            ctl.process_completion(Some(backend), index, cqe.result(), false);
            processed += 1;
        }
        processed
    }
}

fn build_sqe(ctl: &EngineControl, index: u32) -> io_uring::squeue::Entry {
    // SAFETY: the method owns the handle once it is in flight.
    let op = unsafe { *ctl.handle(index).op_data() };
    let entry = match op {
        OpData::Read {
            fd,
            offset,
            iov_count,
        } => {
            // SAFETY: the iovec slice is stable in the shared pool for the
            // life of the operation.
            let iovs = unsafe { ctl.iovec_array_ptr(index) };
            opcode::Readv::new(types::Fd(fd), iovs, iov_count as u32)
                .offset(offset)
                .build()
        }
        OpData::Write {
            fd,
            offset,
            iov_count,
        } => {
            // SAFETY: as for read.
            let iovs = unsafe { ctl.iovec_array_ptr(index) };
            opcode::Writev::new(types::Fd(fd), iovs, iov_count as u32)
                .offset(offset)
                .build()
        }
        OpData::Fsync { fd, datasync } => {
            let flags = if datasync {
                types::FsyncFlags::DATASYNC
            } else {
                types::FsyncFlags::empty()
            };
            opcode::Fsync::new(types::Fd(fd)).flags(flags).build()
        }
        OpData::FlushRange { fd, offset, nbytes } => {
            opcode::SyncFileRange::new(types::Fd(fd), nbytes as u32)
                .offset(offset)
                .build()
        }
        OpData::Nop => opcode::Nop::new().build(),
        OpData::Invalid => panic!("io:{index} submitted without an operation"),
    };
    entry.user_data(u64::from(index))
}

impl IoMethod for UringMethod {
    fn kind(&self) -> IoMethodKind {
        IoMethodKind::IoUring
    }

    fn submit(&self, backend: &mut Backend, staged: &[u32]) -> usize {
        let ctl = backend.control().clone();
        let mut ring = self.rings[backend.id() as usize].lock().unwrap();

        for &index in staged {
            ctl.prepare_submit(index);
        }
        for &index in staged {
            let sqe = build_sqe(&ctl, index);
            // SAFETY: the SQE's buffers live in engine-owned pools until
            // completion.
            unsafe {
                if ring.submission().push(&sqe).is_err() {
                    // Free SQ space (sized for a full batch, so this only
                    // triggers with an unsubmitted backlog) and retry.
                    ring.submit().expect("io_uring submit");
                    ring.submission().push(&sqe).expect("SQ ring full");
                }
            }
        }
        ring.submit().expect("io_uring submit");
        staged.len()
    }

    fn wait_one(&self, backend: &mut Backend, index: u32, ref_generation: u64) -> bool {
        let ctl = backend.control().clone();
        let owner = ctl.handle(index).owner();

        loop {
            match ctl.handle(index).state.observe(ref_generation) {
                Observed::Recycled => return true,
                Observed::Live(HandleState::InFlight) => {}
                Observed::Live(_) => return true,
            }

            let mut ring = self.rings[owner as usize].lock().unwrap();
            if self.drain(&ctl, backend, &mut ring) > 0 {
                continue;
            }

            // Re-check while holding the lock: if the handle is still in
            // flight, its CQE has not been consumed (consumers need this
            // lock) and waiting for one completion cannot hang.
            match ctl.handle(index).state.observe(ref_generation) {
                Observed::Live(HandleState::InFlight) => {}
                _ => return true,
            }
            match ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => panic!("io_uring wait failed: {err}"),
            }
            self.drain(&ctl, backend, &mut ring);
        }
    }
}
