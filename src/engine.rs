//! Engine core: the shared handle slab, per-backend state, and the handle
//! lifecycle operations.
//!
//! # Ownership model
//!
//! The engine is one [`EngineControl`] shared by all backends. Each backend
//! is a registered thread holding a [`Backend`]: a disjoint slice of the
//! handle slab, a free list, a bounded staging array, and a small bounce
//! buffer cache. All lifecycle entry points that may reclaim a handle are
//! `Backend` methods, so reclaim always happens on the owning thread.
//!
//! # Blocking and allocation
//!
//! Exactly five points may block: [`Backend::acquire`],
//! [`Backend::wait_io`], the method's `wait_one`,
//! [`Backend::acquire_bounce_buffer`], and the read stream's wait. Staging
//! and submission never allocate and never block, so I/O can be issued from
//! contexts that forbid both.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::bounce::{BounceBuf, BouncePool};
use crate::config::{EngineConfig, SUBMIT_BATCH_SIZE};
use crate::error::ConfigError;
use crate::handle::{Handle, HandleDesc, HandleFlags, IoRef, OpData, NO_BOUNCE};
use crate::method::{self, IoMethod};
use crate::registry::{self, IoContext, SharedCallbackId, SubjectDesc, SubjectId};
use crate::resowner::ResourceOwner;
use crate::result::{IoResult, IoReturn, IoReturnCell, SubjectData};
use crate::state::{HandleState, Observed};
use crate::BLOCK_SIZE;

/// Bounce buffers cached per backend in front of the global pool.
const BOUNCE_LOCAL_CACHE: usize = 4;

/// Shared iovec storage: every handle owns a fixed slice, so building an
/// operation never allocates. A parallel slab of `u64`s carries opaque
/// per-iovec metadata for completion callbacks.
pub(crate) struct IovecPool {
    iovecs: Box<[UnsafeCell<libc::iovec>]>,
    data: Box<[UnsafeCell<u64>]>,
    per_handle: usize,
}

// SAFETY: slots are only touched by the owning handle's current protocol
// owner; slot ranges of distinct handles are disjoint.
unsafe impl Send for IovecPool {}
unsafe impl Sync for IovecPool {}

impl IovecPool {
    fn new(handles: usize, per_handle: usize) -> Self {
        let total = handles * per_handle;
        Self {
            iovecs: (0..total)
                .map(|_| {
                    UnsafeCell::new(libc::iovec {
                        iov_base: std::ptr::null_mut(),
                        iov_len: 0,
                    })
                })
                .collect(),
            data: (0..total).map(|_| UnsafeCell::new(0)).collect(),
            per_handle,
        }
    }
}

/// Global engine state shared by every backend and method thread.
pub struct EngineControl {
    config: EngineConfig,
    handles: Box<[Handle]>,
    iovecs: IovecPool,
    pub(crate) bounce: BouncePool,
    method: Box<dyn IoMethod>,
    next_backend: AtomicU32,
}

impl EngineControl {
    /// Builds the engine and binds the configured I/O method.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let per_backend = config.io_max_concurrency;
        let per_handle = config.buffer_io_size as usize;
        let total = config.total_handles();

        let handles = (0..total)
            .map(|i| {
                let owner = (i as u32) / per_backend;
                Handle::new(owner, (i * per_handle) as u32)
            })
            .collect();

        let ctl = Arc::new(Self {
            handles,
            iovecs: IovecPool::new(total, per_handle),
            bounce: BouncePool::new(config.io_bounce_buffers as usize),
            method: method::create(&config),
            next_backend: AtomicU32::new(0),
            config,
        });
        ctl.method.start(&ctl);
        Ok(ctl)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers the calling thread as the next backend.
    pub fn register_backend(self: &Arc<Self>) -> Backend {
        let id = self.next_backend.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < self.config.num_backends,
            "more backends registered than configured ({})",
            self.config.num_backends
        );
        let per_backend = self.config.io_max_concurrency;
        let handle_off = id * per_backend;
        // The freshest slots sit on top so early I/Os touch slot 0 first.
        let idle = (handle_off..handle_off + per_backend).rev().collect();
        Backend {
            ctl: Arc::clone(self),
            id,
            handle_off,
            per_backend,
            idle,
            handed_out: None,
            staged: [0; SUBMIT_BATCH_SIZE],
            num_staged: 0,
            idle_bounce: Vec::with_capacity(BOUNCE_LOCAL_CACHE),
            handed_out_bounce: None,
            wait_cursor: 0,
            reports: (0..per_backend).map(|_| None).collect(),
        }
    }

    pub(crate) fn handle(&self, index: u32) -> &Handle {
        &self.handles[index as usize]
    }

    pub(crate) fn handle_count(&self) -> u32 {
        self.handles.len() as u32
    }

    /// Marks a prepared handle in flight. Called by methods in batch order.
    pub(crate) fn prepare_submit(&self, index: u32) {
        self.handle(index)
            .state
            .transition(HandleState::Prepared, HandleState::InFlight);
    }

    /// Raw iovec array of a handle's operation, for method backends.
    ///
    /// SAFETY: caller must own the handle per the state machine and must
    /// not hold the pointer past completion.
    pub(crate) unsafe fn iovec_array_ptr(&self, index: u32) -> *const libc::iovec {
        let off = self.handle(index).iovec_off() as usize;
        self.iovecs.iovecs[off].get()
    }

    /// SAFETY: caller must own the handle per the state machine.
    pub(crate) unsafe fn iovec_raw(&self, index: u32, i: usize) -> libc::iovec {
        debug_assert!(i < self.iovecs.per_handle);
        let off = self.handle(index).iovec_off() as usize;
        *self.iovecs.iovecs[off + i].get()
    }

    /// SAFETY: caller must own the handle per the state machine.
    pub(crate) unsafe fn set_iovec_raw(&self, index: u32, i: usize, base: *mut u8, len: usize) {
        assert!(i < self.iovecs.per_handle, "iovec index out of range");
        let off = self.handle(index).iovec_off() as usize;
        *self.iovecs.iovecs[off + i].get() = libc::iovec {
            iov_base: base.cast(),
            iov_len: len,
        };
    }

    /// SAFETY: caller must own the handle; the target must honor the
    /// staging contract (valid and untouched until completion).
    pub(crate) unsafe fn iovec_as_slice(&self, index: u32, i: usize) -> &[u8] {
        let iov = self.iovec_raw(index, i);
        std::slice::from_raw_parts(iov.iov_base.cast(), iov.iov_len)
    }

    /// SAFETY: as [`EngineControl::iovec_as_slice`], plus exclusivity.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn iovec_as_slice_mut(&self, index: u32, i: usize) -> &mut [u8] {
        let iov = self.iovec_raw(index, i);
        std::slice::from_raw_parts_mut(iov.iov_base.cast(), iov.iov_len)
    }

    /// SAFETY: caller must own the handle per the state machine.
    pub(crate) unsafe fn io_data(&self, index: u32) -> &[u64] {
        let handle = self.handle(index);
        let len = handle.iovec_data_len() as usize;
        let off = handle.iovec_off() as usize;
        std::slice::from_raw_parts(self.iovecs.data[off].get(), len)
    }

    /// Total byte count a read/write op asked for, from its iovec lengths.
    ///
    /// SAFETY: caller must own the handle per the state machine.
    pub(crate) unsafe fn op_byte_count(&self, index: u32) -> u64 {
        let count = self.handle(index).op_data().iov_count() as usize;
        let mut total = 0u64;
        for i in 0..count {
            total += self.iovec_raw(index, i).iov_len as u64;
        }
        total
    }

    /// Advances an in-flight I/O to its terminal state: claims the reap,
    /// runs the completion callback chain, publishes the distilled result,
    /// wakes waiters, and reclaims if the completing party owns the handle.
    ///
    /// Returns false if another reaper already claimed this completion.
    pub(crate) fn process_completion(
        &self,
        backend: Option<&mut Backend>,
        index: u32,
        raw_result: i32,
        local: bool,
    ) -> bool {
        if !self.handle(index).state.begin_reap() {
            return false;
        }
        self.complete_reaped(backend, index, raw_result, local);
        true
    }

    /// Completion tail for a reap the caller already claimed (methods that
    /// must consume a kernel-side result exactly once claim first).
    pub(crate) fn complete_reaped(
        &self,
        backend: Option<&mut Backend>,
        index: u32,
        raw_result: i32,
        local: bool,
    ) {
        let handle = self.handle(index);
        debug_assert_eq!(handle.state.state(), HandleState::Reaped);
        handle.state.set_raw_result(raw_result);

        let cx = IoContext { ctl: self, index };
        let result = registry::run_completion_chain(&cx);
        let (word, distilled_result) = result.pack();
        handle.state.publish_completion(word, distilled_result, local);
        handle.broadcast();

        if let Some(backend) = backend {
            if backend.id == handle.owner() {
                backend.reclaim(index);
            }
        }
    }
}

/// Token for the backend's single handed-out handle.
///
/// Not `Copy`/`Clone`: staging or releasing the handle consumes the token,
/// which is how the type system enforces that a handle is never mutated
/// after it left the owner's hands.
pub struct AcquiredHandle {
    index: u32,
}

impl AcquiredHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Per-backend engine state. One per registered thread; not shared.
pub struct Backend {
    ctl: Arc<EngineControl>,
    id: u32,
    handle_off: u32,
    per_backend: u32,
    /// Idle handles of this backend's slice (global indices).
    idle: Vec<u32>,
    handed_out: Option<u32>,
    /// Staged, unsubmitted handles. Fixed capacity: staging never allocates.
    staged: [u32; SUBMIT_BATCH_SIZE],
    num_staged: usize,
    idle_bounce: Vec<u32>,
    /// Handed-out bounce buffer and the scope it was charged to.
    handed_out_bounce: Option<(u32, Option<u64>)>,
    /// Round-robin position for the wait-for-free scan.
    wait_cursor: u32,
    /// Per-slot result sinks, written at reclaim.
    reports: Box<[Option<Arc<IoReturnCell>>]>,
}

impl Backend {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn control(&self) -> &Arc<EngineControl> {
        &self.ctl
    }

    fn local_slot(&self, index: u32) -> usize {
        debug_assert!(index >= self.handle_off && index < self.handle_off + self.per_backend);
        (index - self.handle_off) as usize
    }

    // ------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------

    /// Non-blocking acquire. Returns `None` when every slot of this
    /// backend's slice is busy.
    pub fn try_acquire(
        &mut self,
        owner: Option<&ResourceOwner>,
        report: Option<&Arc<IoReturnCell>>,
    ) -> Option<AcquiredHandle> {
        if self.num_staged >= SUBMIT_BATCH_SIZE {
            debug_assert_eq!(self.num_staged, SUBMIT_BATCH_SIZE);
            self.submit_staged();
        }

        assert!(
            self.handed_out.is_none(),
            "API violation: only one I/O can be handed out"
        );

        let ctl = Arc::clone(&self.ctl);
        let index = self.idle.pop()?;
        let handle = ctl.handle(index);
        debug_assert_eq!(handle.state.state(), HandleState::Idle);
        debug_assert_eq!(handle.owner(), self.id);

        handle
            .state
            .transition(HandleState::Idle, HandleState::HandedOut);
        self.handed_out = Some(index);

        if let Some(owner) = owner {
            owner.remember_io(IoRef::new(index, handle.state.generation()));
            // SAFETY: we own the handle in HandedOut.
            unsafe { handle.set_has_resowner(true) };
        }
        if let Some(cell) = report {
            self.reports[self.local_slot(index)] = Some(Arc::clone(cell));
            // SAFETY: as above.
            unsafe { handle.set_has_report(true) };
        }

        Some(AcquiredHandle { index })
    }

    /// Blocking acquire: submits staged work and waits for a slot to free
    /// up when the slice is exhausted.
    pub fn acquire(
        &mut self,
        owner: Option<&ResourceOwner>,
        report: Option<&Arc<IoReturnCell>>,
    ) -> AcquiredHandle {
        loop {
            if let Some(handle) = self.try_acquire(owner, report) {
                return handle;
            }
            self.wait_for_free();
        }
    }

    /// Returns an unused handed-out handle straight to the free list.
    pub fn release(&mut self, ioh: AcquiredHandle) {
        if self.handed_out != Some(ioh.index) {
            panic!("API violation: release of a handle that is not handed out");
        }
        debug_assert_eq!(
            self.ctl.handle(ioh.index).state.state(),
            HandleState::HandedOut
        );
        self.handed_out = None;
        self.reclaim(ioh.index);
    }

    /// Captures an (index, generation) reference for later wait/check.
    pub fn io_ref(&self, ioh: &AcquiredHandle) -> IoRef {
        let handle = self.ctl.handle(ioh.index);
        IoRef::new(ioh.index, handle.state.generation())
    }

    // ------------------------------------------------------------------
    // Definition
    // ------------------------------------------------------------------

    /// Sets what the I/O operates against. Must precede staging.
    pub fn set_subject(&mut self, ioh: &AcquiredHandle, subject: SubjectId, data: SubjectData) {
        let handle = self.ctl.handle(ioh.index);
        debug_assert_eq!(handle.state.state(), HandleState::HandedOut);
        // SAFETY: we own the handle in HandedOut.
        unsafe {
            handle.set_subject(subject);
            *handle.subject_data_mut() = data;
        }
        tracing::trace!(io = ioh.index, subject = subject.name(), "set subject");
    }

    /// Appends a shared completion callback (bounded; never allocates).
    pub fn add_callback(&mut self, ioh: &AcquiredHandle, id: SharedCallbackId) {
        registry::check_registerable(id);
        let handle = self.ctl.handle(ioh.index);
        // SAFETY: we own the handle in HandedOut.
        let list = unsafe { handle.callbacks_mut() };
        list.push(id);
        tracing::trace!(
            io = ioh.index,
            callback = id.as_u8(),
            num = list.len(),
            "add callback"
        );
    }

    pub fn set_flag(&mut self, ioh: &AcquiredHandle, flag: HandleFlags) {
        // SAFETY: we own the handle in HandedOut.
        unsafe { self.ctl.handle(ioh.index).flags_mut().insert(flag) };
    }

    /// Attaches opaque per-iovec metadata for completion callbacks.
    pub fn set_io_data(&mut self, ioh: &AcquiredHandle, data: &[u64]) {
        let per_handle = self.ctl.config.buffer_io_size as usize;
        assert!(data.len() <= per_handle, "io_data exceeds the iovec slice");
        let handle = self.ctl.handle(ioh.index);
        let off = handle.iovec_off() as usize;
        // SAFETY: we own the handle in HandedOut; the slot range is ours.
        unsafe {
            for (i, &word) in data.iter().enumerate() {
                *self.ctl.iovecs.data[off + i].get() = word;
            }
            handle.set_iovec_data_len(data.len() as u8);
        }
    }

    /// Points the i-th iovec slot at raw memory.
    ///
    /// # Safety
    ///
    /// `base..base+len` must stay valid and untouched by anything but this
    /// I/O until the handle reaches a terminal state.
    pub unsafe fn set_iovec(&mut self, ioh: &AcquiredHandle, i: usize, base: *mut u8, len: usize) {
        self.ctl.set_iovec_raw(ioh.index, i, base, len);
    }

    /// Points the i-th iovec slot at a bounce buffer this backend holds.
    pub fn set_iovec_bounce(&mut self, ioh: &AcquiredHandle, i: usize, bb: &BounceBuf) {
        let base = self.ctl.bounce.ptr(bb.index());
        // SAFETY: once associated, the bounce buffer is released only at
        // handle reclaim, which happens after completion.
        unsafe { self.ctl.set_iovec_raw(ioh.index, i, base, BLOCK_SIZE) };
    }

    // ------------------------------------------------------------------
    // Staging and submission
    // ------------------------------------------------------------------

    /// Encodes the operation, runs prepare hooks, and stages the handle for
    /// batched submission (or executes inline when the method requires it).
    /// Consumes the token: the operation now belongs to the engine.
    pub(crate) fn stage(&mut self, ioh: AcquiredHandle, op: OpData) {
        let index = ioh.index;
        let ctl = Arc::clone(&self.ctl);
        let handle = ctl.handle(index);
        debug_assert_eq!(self.handed_out, Some(index));
        // SAFETY: we own the handle in HandedOut.
        unsafe {
            assert!(
                handle.subject() != SubjectId::INVALID,
                "API violation: operation staged without a subject"
            );
            *handle.op_data_mut() = op;
        }

        handle
            .state
            .transition(HandleState::HandedOut, HandleState::Defined);
        // A new I/O may be handed out while this one is staged.
        self.handed_out = None;

        registry::run_prepare_chain(&IoContext { ctl: &*ctl, index });

        handle
            .state
            .transition(HandleState::Defined, HandleState::Prepared);
        tracing::trace!(io = index, op = op.name(), "prepared");

        // SAFETY: owner read; flags settle before staging.
        let force_sync = unsafe { handle.flags() }.contains(HandleFlags::SYNCHRONOUS);
        if force_sync || ctl.method.needs_synchronous_execution(&ctl, index) {
            ctl.prepare_submit(index);
            crate::ops::perform_synchronously(&ctl, self, index);
        } else {
            assert!(self.num_staged < SUBMIT_BATCH_SIZE);
            self.staged[self.num_staged] = index;
            self.num_staged += 1;
        }
    }

    /// Submits everything staged locally. Never allocates; with no staged
    /// handles it is a no-op.
    pub fn submit_staged(&mut self) {
        if self.num_staged == 0 {
            return;
        }
        let staged = self.staged;
        let count = self.num_staged;
        self.num_staged = 0;

        let ctl = Arc::clone(&self.ctl);
        let submitted = ctl.method.submit(self, &staged[..count]);
        debug_assert_eq!(submitted, count);
        tracing::debug!(backend = self.id, submitted, "submitted staged I/Os");
    }

    pub fn have_staged(&self) -> bool {
        self.num_staged > 0
    }

    /// Flushes staged operations before `fd` is closed, so no staged
    /// operation ends up targeting a recycled descriptor.
    pub fn closing_fd(&mut self, _fd: std::os::unix::io::RawFd) {
        // Submitting everything is coarser than strictly necessary but
        // keeps the staging array scan-free.
        self.submit_staged();
    }

    /// Scope-end assertion hook: carrying a handed-out handle across a
    /// transactional boundary is an API violation.
    pub fn at_scope_end(&self) {
        assert!(
            self.handed_out.is_none(),
            "handle handed out across scope end"
        );
        assert!(
            self.handed_out_bounce.is_none(),
            "bounce buffer handed out across scope end"
        );
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Blocks until the referenced I/O is terminal or its slot recycled.
    /// Callable with any backend's reference.
    pub fn wait_io(&mut self, ioref: IoRef) {
        if !ioref.is_valid() {
            return;
        }
        let index = ioref.index();
        assert!(index < self.ctl.handle_count());
        let ref_generation = ioref.generation();
        let am_owner = self.ctl.handle(index).owner() == self.id;

        match self.ctl.handle(index).state.observe(ref_generation) {
            Observed::Recycled => return,
            Observed::Live(state) if am_owner => match state {
                HandleState::Defined | HandleState::Prepared => self.submit_staged(),
                HandleState::CompletedLocal => {
                    // Someone else drove our I/O to completion; reclaim
                    // eagerly so the result sink is filled.
                    self.reclaim(index);
                    return;
                }
                HandleState::InFlight | HandleState::Reaped | HandleState::CompletedShared => {}
                HandleState::Idle | HandleState::HandedOut => {
                    panic!("waiting for own I/O in wrong state: {}", state.name())
                }
            },
            Observed::Live(_) => {}
        }

        loop {
            let observed = self.ctl.handle(index).state.observe(ref_generation);
            match observed {
                Observed::Recycled => return,
                Observed::Live(state) => match state {
                    HandleState::Idle | HandleState::HandedOut => {
                        panic!("I/O in wrong state: {}", state.name())
                    }
                    HandleState::InFlight => {
                        let ctl = Arc::clone(&self.ctl);
                        if ctl.method.wait_one(self, index, ref_generation) {
                            continue;
                        }
                        tracing::debug!(io = index, "sleeping on condition variable");
                        self.ctl
                            .handle(index)
                            .sleep_while_processing(ref_generation);
                    }
                    HandleState::Defined | HandleState::Prepared | HandleState::Reaped => {
                        self.ctl
                            .handle(index)
                            .sleep_while_processing(ref_generation);
                    }
                    HandleState::CompletedShared => {
                        if am_owner {
                            self.reclaim(index);
                        }
                        return;
                    }
                    HandleState::CompletedLocal => return,
                },
            }
        }
    }

    /// Non-blocking completion check.
    pub fn check_done(&mut self, ioref: IoRef) -> bool {
        if !ioref.is_valid() {
            return true;
        }
        let index = ioref.index();
        let ctl = Arc::clone(&self.ctl);
        let handle = ctl.handle(index);
        match handle.state.observe(ioref.generation()) {
            Observed::Recycled => true,
            Observed::Live(HandleState::Idle) => true,
            Observed::Live(state) if state.is_terminal() => {
                if handle.owner() == self.id {
                    self.reclaim(index);
                }
                true
            }
            Observed::Live(_) => false,
        }
    }

    /// Frees at least one slot of this backend's slice, blocking if
    /// necessary: reclaim anything already complete, submit staged work,
    /// then wait round-robin on an in-flight handle.
    fn wait_for_free(&mut self) {
        let mut reclaimed = 0;
        for i in 0..self.per_backend {
            let index = self.handle_off + i;
            if self.ctl.handle(index).state.state() == HandleState::CompletedShared {
                self.reclaim(index);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            return;
        }

        if self.num_staged > 0 {
            tracing::debug!(backend = self.id, "submitting while acquiring a free handle");
            self.submit_staged();
        }

        let mut found_handed_out = false;
        let start = self.wait_cursor;
        for i in start..start + self.per_backend {
            let pos = i % self.per_backend;
            let index = self.handle_off + pos;
            let (state, generation) = {
                let handle = self.ctl.handle(index);
                (handle.state.state(), handle.state.generation())
            };
            match state {
                // Completion can land between the submission above and this
                // scan, so Idle is reachable here.
                HandleState::Idle => return,
                HandleState::Defined | HandleState::Prepared | HandleState::CompletedLocal => {
                    panic!("unexpected state in free-wait: io:{index} {}", state.name())
                }
                HandleState::HandedOut => {
                    assert!(!found_handed_out, "more than one handed out I/O");
                    found_handed_out = true;
                }
                HandleState::InFlight | HandleState::Reaped => {
                    self.wait_io(IoRef::new(index, generation));
                    tracing::debug!(io = index, "waited for a free handle");
                    self.wait_cursor = pos;
                    return;
                }
                HandleState::CompletedShared => {
                    self.reclaim(index);
                    self.wait_cursor = pos;
                    return;
                }
            }
        }

        panic!("could not reclaim any handle");
    }

    // ------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------

    /// Returns a terminal (or never-staged) handle of this backend to the
    /// idle list: report the distilled result, free bounce buffers, clear
    /// the definition, bump the generation.
    pub(crate) fn reclaim(&mut self, index: u32) {
        let ctl = Arc::clone(&self.ctl);
        let handle = ctl.handle(index);
        assert_eq!(handle.owner(), self.id, "cannot reclaim a foreign I/O");

        let state = handle.state.state();
        tracing::trace!(
            backend = self.id,
            "reclaiming {}",
            HandleDesc { index, handle }
        );

        let slot = self.local_slot(index);
        // SAFETY: the owner holds the handle in a terminal or HandedOut
        // state throughout reclaim; no other party touches it.
        unsafe {
            if handle.has_report() {
                if state != HandleState::HandedOut {
                    if let Some(cell) = &self.reports[slot] {
                        let (word, result) = handle.state.distilled();
                        cell.set(IoReturn {
                            result: IoResult::unpack(word, result),
                            subject_data: *handle.subject_data(),
                        });
                    }
                }
                handle.set_has_report(false);
            }
            self.reports[slot] = None;

            let mut bb = handle.bounce_head();
            while bb != NO_BOUNCE {
                let next = ctl.bounce.link(bb);
                ctl.bounce.set_link(bb, NO_BOUNCE);
                self.push_bounce_idle(bb);
                bb = next;
            }
            handle.set_bounce_head(NO_BOUNCE);

            handle.set_has_resowner(false);
            handle.callbacks_mut().clear();
            handle.set_iovec_data_len(0);
            *handle.flags_mut() = HandleFlags::NONE;
            *handle.op_data_mut() = OpData::Invalid;
            handle.set_subject(SubjectId::INVALID);
        }

        handle.state.reclaim_publish();
        self.idle.push(index);
    }

    /// Reclaim entry for the resource-owner walker: also clears the
    /// handed-out slot when the scope dies mid-build.
    pub(crate) fn resowner_reclaim(&mut self, index: u32) {
        if self.handed_out == Some(index) {
            self.handed_out = None;
        }
        self.reclaim(index);
    }

    /// Drops the result sink of an unwinding scope: the issuer's frame is
    /// going away, so nothing must be reported into it later.
    pub(crate) fn clear_report(&mut self, index: u32) {
        let ctl = Arc::clone(&self.ctl);
        let handle = ctl.handle(index);
        self.reports[self.local_slot(index)] = None;
        // SAFETY: owner-thread field, see reclaim.
        unsafe { handle.set_has_report(false) };
    }

    // ------------------------------------------------------------------
    // Bounce buffers
    // ------------------------------------------------------------------

    /// Acquires a bounce buffer, blocking on pool exhaustion.
    pub fn acquire_bounce_buffer(&mut self, owner: Option<&ResourceOwner>) -> BounceBuf {
        assert!(
            self.handed_out_bounce.is_none(),
            "API violation: only one bounce buffer can be handed out"
        );
        let index = loop {
            if let Some(index) = self.idle_bounce.pop().or_else(|| self.ctl.bounce.try_pop()) {
                break index;
            }
            self.wait_for_free_bounce();
        };
        self.handed_out_bounce = Some((index, owner.map(|o| o.scope_id())));
        BounceBuf { index }
    }

    /// Transfers a handed-out bounce buffer into a handle; it will be
    /// released automatically at reclaim. Vectored operations may attach
    /// many buffers to one handle.
    pub fn associate_bounce_buffer(&mut self, ioh: &AcquiredHandle, bb: BounceBuf) {
        match self.handed_out_bounce.take() {
            Some((held, _)) if held == bb.index() => {}
            _ => panic!("API violation: can only associate the handed out bounce buffer"),
        }
        let handle = self.ctl.handle(ioh.index);
        // SAFETY: we own the handle (HandedOut) and the buffer (grant).
        unsafe {
            let head = handle.bounce_head();
            self.ctl.bounce.set_link(bb.index(), head);
            handle.set_bounce_head(bb.index());
        }
    }

    /// Returns an unassociated bounce buffer to the pool.
    pub fn release_bounce_buffer(&mut self, bb: BounceBuf) {
        match self.handed_out_bounce.take() {
            Some((held, _)) if held == bb.index() => {}
            _ => panic!("API violation: can only release the handed out bounce buffer"),
        }
        self.push_bounce_idle(bb.index());
    }

    /// Bytes of a bounce buffer this backend holds.
    pub fn bounce_bytes_mut(&mut self, bb: &BounceBuf) -> &mut [u8] {
        debug_assert!(matches!(self.handed_out_bounce, Some((held, _)) if held == bb.index()));
        // SAFETY: the grant is exclusive and `&mut self` serializes access.
        unsafe { std::slice::from_raw_parts_mut(self.ctl.bounce.ptr(bb.index()), BLOCK_SIZE) }
    }

    pub(crate) fn handed_out_bounce_for_scope(&self, scope_id: u64) -> Option<u32> {
        match self.handed_out_bounce {
            Some((index, Some(owner))) if owner == scope_id => Some(index),
            _ => None,
        }
    }

    pub(crate) fn drop_handed_out_bounce(&mut self, index: u32) {
        debug_assert!(matches!(self.handed_out_bounce, Some((held, _)) if held == index));
        self.handed_out_bounce = None;
        self.push_bounce_idle(index);
    }

    fn push_bounce_idle(&mut self, index: u32) {
        if self.idle_bounce.len() < BOUNCE_LOCAL_CACHE {
            self.idle_bounce.push(index);
        } else {
            self.ctl.bounce.push(index);
        }
    }

    /// Blocks until some bounce buffer can be free: submit staged work,
    /// then wait on handles that hold buffers, reclaiming completions.
    fn wait_for_free_bounce(&mut self) {
        assert!(self.ctl.bounce.count() > 0, "no bounce buffers configured");
        if self.num_staged > 0 {
            tracing::debug!(backend = self.id, "submitting while acquiring a bounce buffer");
            self.submit_staged();
        }

        for i in 0..self.per_backend {
            let index = self.handle_off + i;
            let (state, generation, has_bounce) = {
                let handle = self.ctl.handle(index);
                // SAFETY: the bounce list of our own handle is written only
                // by this thread (before submission and at reclaim).
                let has_bounce = unsafe { handle.bounce_head() } != NO_BOUNCE;
                (handle.state.state(), handle.state.generation(), has_bounce)
            };
            match state {
                HandleState::InFlight | HandleState::Reaped if has_bounce => {
                    self.wait_io(IoRef::new(index, generation));
                }
                HandleState::CompletedShared => self.reclaim(index),
                _ => continue,
            }
            if !self.idle_bounce.is_empty() || self.ctl.bounce.has_free() {
                return;
            }
        }

        if self.idle_bounce.is_empty() && !self.ctl.bounce.has_free() {
            panic!("no bounce buffers available");
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Log-safe description of a handed-out handle's subject.
    pub fn describe_subject(&self, ioh: &AcquiredHandle) -> String {
        let handle = self.ctl.handle(ioh.index);
        // SAFETY: we own the handle in HandedOut.
        let (subject, data) = unsafe { (handle.subject(), *handle.subject_data()) };
        format!("{}", SubjectDesc { subject, data: &data })
    }
}
