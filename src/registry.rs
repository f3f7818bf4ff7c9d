//! Subject and shared-callback registries.
//!
//! Handles are shared between backends, so they cannot carry function
//! pointers (the original design targets processes whose address-space
//! layouts differ; an id-indexed static table is the portable encoding and
//! we keep it). Subjects say what an I/O is *against* and provide describe
//! and reopen hooks; shared callbacks transform the raw method result into
//! the distilled result at completion, and reconstruct a user-visible error
//! from it at the point it is finally reported.
//!
//! Chains run in reverse registration order: the media-level callback is
//! registered first and therefore distills last, so its verdict wins for
//! low-level failures.

use std::fmt;

use crate::engine::EngineControl;
use crate::error::IoFailure;
use crate::handle::{Handle, OpData};
use crate::result::{IoResult, SubjectData};
use crate::stream::file_source;

/// Upper bound on shared callbacks per handle.
pub const MAX_SHARED_CALLBACKS: usize = 4;

/// Identifies what an I/O operates against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubjectId(u8);

impl SubjectId {
    pub const INVALID: Self = Self(0);
    /// A run of blocks in a relation file.
    pub const FILE_BLOCK: Self = Self(1);

    pub(crate) fn as_u8(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        subject_info(self).name
    }
}

/// Static descriptor of a subject.
pub struct SubjectInfo {
    pub name: &'static str,
    /// Re-derives a usable file descriptor when the submitting context's
    /// descriptor is gone. Backends in this crate are threads sharing one
    /// descriptor table, so the hook exists for the contract and stays
    /// unused by the built-in subjects.
    pub reopen: Option<fn(&IoContext<'_>) -> std::os::unix::io::RawFd>,
    /// Formats the subject data for diagnostics.
    pub describe: Option<fn(&SubjectData, &mut fmt::Formatter<'_>) -> fmt::Result>,
}

static SUBJECTS: [SubjectInfo; 2] = [
    SubjectInfo {
        name: "invalid",
        reopen: None,
        describe: None,
    },
    SubjectInfo {
        name: "file_block",
        reopen: None,
        describe: Some(file_source::describe_file_block),
    },
];

pub(crate) fn subject_info(id: SubjectId) -> &'static SubjectInfo {
    let idx = id.0 as usize;
    assert!(idx < SUBJECTS.len(), "subject {idx} is out of range");
    &SUBJECTS[idx]
}

/// Identifies a shared completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedCallbackId(u8);

impl SharedCallbackId {
    pub const INVALID: Self = Self(0);
    /// Media layer: turns negative raw results into I/O errors and
    /// insufficient byte counts into short reads.
    pub const FILE_BLOCK: Self = Self(1);
    /// Verifies page checksums after a successful read.
    pub const PAGE_VERIFY: Self = Self(2);
    /// Stamps page checksums into the staged pages before a write.
    pub const PAGE_STAMP: Self = Self(3);

    pub(crate) fn as_u8(self) -> u8 {
        self.0
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        Self(raw)
    }
}

/// Static descriptor of a shared callback.
///
/// `prepare` runs inline at define time on the issuing backend; `complete`
/// runs at completion on whichever backend reaps the I/O; `error` runs on
/// the issuer when it finally reports a failed distilled result.
pub struct SharedCallbacks {
    pub prepare: Option<fn(&IoContext<'_>)>,
    pub complete: Option<fn(&IoContext<'_>, IoResult) -> IoResult>,
    pub error: Option<fn(&IoResult, &SubjectData) -> IoFailure>,
}

static CALLBACKS: [SharedCallbacks; 4] = [
    SharedCallbacks {
        prepare: None,
        complete: None,
        error: None,
    },
    file_source::FILE_BLOCK_CALLBACKS,
    file_source::PAGE_VERIFY_CALLBACKS,
    file_source::PAGE_STAMP_CALLBACKS,
];

pub(crate) fn callback_info(id: SharedCallbackId) -> &'static SharedCallbacks {
    let idx = id.0 as usize;
    assert!(idx < CALLBACKS.len(), "callback {idx} is out of range");
    &CALLBACKS[idx]
}

/// Checks an id at registration time; the complete hook must exist.
pub(crate) fn check_registerable(id: SharedCallbackId) {
    assert!(
        callback_info(id).complete.is_some(),
        "callback {} is undefined",
        id.0
    );
}

/// Read-only view of a handle offered to callback hooks.
///
/// Constructed only by the chain runners, while the calling party owns the
/// handle per the state machine (the issuer during prepare, the reaper
/// during completion).
pub struct IoContext<'a> {
    pub(crate) ctl: &'a EngineControl,
    pub(crate) index: u32,
}

impl IoContext<'_> {
    fn handle(&self) -> &Handle {
        self.ctl.handle(self.index)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn raw_result(&self) -> i32 {
        self.handle().state.raw_result()
    }

    pub fn op(&self) -> OpData {
        // SAFETY: contexts exist only while the calling party owns the
        // handle (see type docs).
        unsafe { *self.handle().op_data() }
    }

    pub fn subject_data(&self) -> SubjectData {
        // SAFETY: as in `op`.
        unsafe { *self.handle().subject_data() }
    }

    /// Bytes the operation asked to transfer, summed over its iovecs.
    pub fn requested_bytes(&self) -> u64 {
        // SAFETY: as in `op`.
        unsafe { self.ctl.op_byte_count(self.index) }
    }

    /// Per-iovec opaque metadata the issuer attached.
    pub fn io_data(&self) -> &[u64] {
        // SAFETY: as in `op`; the slice lives in the engine's pool.
        unsafe { self.ctl.io_data(self.index) }
    }

    /// Bytes of the i-th iovec of this handle's operation.
    ///
    /// Valid per the staging contract: iovec targets stay untouched and
    /// alive until the I/O completes.
    pub fn iovec_bytes(&self, i: usize) -> &[u8] {
        let count = self.op().iov_count() as usize;
        assert!(i < count, "iovec {i} out of range (op has {count})");
        // SAFETY: staging contract above; the reaper is the only party
        // reading the target while the handle is being completed.
        unsafe { self.ctl.iovec_as_slice(self.index, i) }
    }

    /// Mutable access to the i-th iovec, for prepare hooks that stamp data
    /// into the staged pages. The closure shape keeps the exclusive borrow
    /// from escaping.
    pub fn with_iovec_bytes_mut<R>(&self, i: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let count = self.op().iov_count() as usize;
        assert!(i < count, "iovec {i} out of range (op has {count})");
        // SAFETY: prepare hooks run inline on the issuing backend before
        // submission; nothing else touches the target yet.
        f(unsafe { self.ctl.iovec_as_slice_mut(self.index, i) })
    }
}

/// Runs the prepare hooks, most recently registered first.
pub(crate) fn run_prepare_chain(cx: &IoContext<'_>) {
    // SAFETY: the issuer owns the handle during define.
    let list = unsafe { *cx.handle().callbacks() };
    for id in list.reversed() {
        if let Some(prepare) = callback_info(id).prepare {
            tracing::trace!(io = cx.index, callback = id.0, "prepare hook");
            prepare(cx);
        }
    }
}

/// Runs the completion hooks, most recently registered first, threading the
/// result through the chain. The final value is the distilled result.
pub(crate) fn run_completion_chain(cx: &IoContext<'_>) -> IoResult {
    // SAFETY: the reaper owns the handle during Reaped.
    let list = unsafe { *cx.handle().callbacks() };
    let mut result = IoResult::from_raw(cx.raw_result());
    for id in list.reversed() {
        if let Some(complete) = callback_info(id).complete {
            result = complete(cx, result);
            tracing::trace!(
                io = cx.index,
                callback = id.0,
                status = ?result.status,
                result = result.result,
                "completion hook"
            );
        }
    }
    result
}

/// Reconstructs the user-visible error for a failed (or short) distilled
/// result by dispatching to the error hook of the callback that produced it.
pub fn raise_error(result: &IoResult, subject_data: &SubjectData) -> IoFailure {
    use crate::result::IoResultStatus;
    debug_assert!(!matches!(
        result.status,
        IoResultStatus::Ok | IoResultStatus::Unknown
    ));
    let info = callback_info(result.id);
    match info.error {
        Some(error) => error(result, subject_data),
        None => panic!("callback {} does not have an error hook", result.id.0),
    }
}

/// Formats subject data through the subject's describe hook.
pub(crate) struct SubjectDesc<'a> {
    pub subject: SubjectId,
    pub data: &'a SubjectData,
}

impl fmt::Display for SubjectDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match subject_info(self.subject).describe {
            Some(describe) => describe(self.data, f),
            None => f.write_str(self.subject.name()),
        }
    }
}
