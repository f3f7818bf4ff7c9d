//! I/O handle layout and references.
//!
//! Handles live in one shared slab owned by the engine. A handle's fields
//! split into three protection classes:
//!
//! - **Fixed**: owner backend and iovec offset, written once at engine
//!   construction.
//! - **Atomic**: state, generation and results, in the [`StateCell`] with
//!   its publication protocol.
//! - **Protocol-owned**: operation payload, subject, callback list, flags.
//!   These are `UnsafeCell`s touched only by the party the state machine
//!   says owns the handle: the issuing backend in `HandedOut..Prepared`,
//!   the I/O method in `InFlight`, the reaper in `Reaped`, and the owner
//!   again at reclaim. Accessors are `unsafe fn`s restating that contract.
//!
//! Callers never hold `&Handle` across a potential reclaim; they hold an
//! [`IoRef`] and revalidate the generation on every use.

use std::cell::UnsafeCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};

use crossbeam_utils::CachePadded;

use crate::registry::{SharedCallbackId, SubjectId, MAX_SHARED_CALLBACKS};
use crate::result::SubjectData;
use crate::state::{HandleState, Observed, StateCell};

/// Sentinel index for "no bounce buffer" in the intrusive per-handle list.
pub(crate) const NO_BOUNCE: u32 = u32::MAX;

/// A pointer-substitute for one incarnation of a handle.
///
/// Safe to keep across reclaim: any dereference revalidates the generation
/// and reports the I/O as completed once the slot was recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRef {
    index: u32,
    generation: u64,
}

impl IoRef {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    pub(crate) fn new(index: u32, generation: u64) -> Self {
        debug_assert_ne!(generation, 0);
        Self { index, generation }
    }

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    pub fn index(&self) -> u32 {
        debug_assert!(self.is_valid());
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Operation tag and payload of a handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpData {
    #[default]
    Invalid,
    Nop,
    Read {
        fd: RawFd,
        offset: u64,
        iov_count: u16,
    },
    Write {
        fd: RawFd,
        offset: u64,
        iov_count: u16,
    },
    Fsync {
        fd: RawFd,
        datasync: bool,
    },
    FlushRange {
        fd: RawFd,
        offset: u64,
        nbytes: u64,
    },
}

impl OpData {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Nop => "nop",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Fsync { .. } => "fsync",
            Self::FlushRange { .. } => "flush_range",
        }
    }

    /// Number of iovec slots the operation transfers through.
    pub fn iov_count(&self) -> u16 {
        match *self {
            Self::Read { iov_count, .. } | Self::Write { iov_count, .. } => iov_count,
            _ => 0,
        }
    }
}

/// Small per-handle flag set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleFlags {
    bits: u8,
}

impl HandleFlags {
    pub const NONE: Self = Self { bits: 0 };
    /// Force synchronous inline execution regardless of the bound method.
    pub const SYNCHRONOUS: Self = Self { bits: 1 };

    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn insert(&mut self, other: Self) {
        self.bits |= other.bits;
    }
}

/// Ordered list of shared-callback ids, inline and fixed-capacity so that
/// registering a callback never allocates.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CallbackList {
    ids: [u8; MAX_SHARED_CALLBACKS],
    len: u8,
}

impl CallbackList {
    pub(crate) fn push(&mut self, id: SharedCallbackId) {
        assert!(
            (self.len as usize) < MAX_SHARED_CALLBACKS,
            "too many shared callbacks, the max is {MAX_SHARED_CALLBACKS}"
        );
        self.ids[self.len as usize] = id.as_u8();
        self.len += 1;
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    /// Ids in reverse registration order, the order chains run in.
    pub(crate) fn reversed(&self) -> impl Iterator<Item = SharedCallbackId> + '_ {
        self.ids[..self.len as usize]
            .iter()
            .rev()
            .map(|&id| SharedCallbackId::from_u8(id))
    }
}

/// One I/O handle in the shared slab.
pub struct Handle {
    /// Hot cross-thread part, padded away from the owner fields.
    pub(crate) state: CachePadded<StateCell>,
    /// Owning backend id. Fixed at engine construction.
    owner: u32,
    /// First iovec slot of this handle's slice in the global pool. Fixed.
    iovec_off: u32,
    mutex: Mutex<()>,
    condvar: Condvar,

    op: UnsafeCell<OpData>,
    subject: UnsafeCell<SubjectId>,
    subject_data: UnsafeCell<SubjectData>,
    callbacks: UnsafeCell<CallbackList>,
    flags: UnsafeCell<HandleFlags>,
    iovec_data_len: UnsafeCell<u8>,
    bounce_head: UnsafeCell<u32>,
    has_resowner: UnsafeCell<bool>,
    has_report: UnsafeCell<bool>,
}

// SAFETY: the UnsafeCell fields are only touched by the handle's current
// protocol owner (see module docs); everything else is atomic or internally
// synchronized. The state machine transfers ownership with Release/Acquire
// pairs in StateCell.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub(crate) fn new(owner: u32, iovec_off: u32) -> Self {
        Self {
            state: CachePadded::new(StateCell::new()),
            owner,
            iovec_off,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            op: UnsafeCell::new(OpData::Invalid),
            subject: UnsafeCell::new(SubjectId::INVALID),
            subject_data: UnsafeCell::new(SubjectData::default()),
            callbacks: UnsafeCell::new(CallbackList::default()),
            flags: UnsafeCell::new(HandleFlags::NONE),
            iovec_data_len: UnsafeCell::new(0),
            bounce_head: UnsafeCell::new(NO_BOUNCE),
            has_resowner: UnsafeCell::new(false),
            has_report: UnsafeCell::new(false),
        }
    }

    pub(crate) fn owner(&self) -> u32 {
        self.owner
    }

    pub(crate) fn iovec_off(&self) -> u32 {
        self.iovec_off
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn op_data(&self) -> &OpData {
        &*self.op.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn op_data_mut(&self) -> &mut OpData {
        &mut *self.op.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn subject(&self) -> SubjectId {
        *self.subject.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn set_subject(&self, subject: SubjectId) {
        *self.subject.get() = subject;
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn subject_data(&self) -> &SubjectData {
        &*self.subject_data.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn subject_data_mut(&self) -> &mut SubjectData {
        &mut *self.subject_data.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn callbacks(&self) -> &CallbackList {
        &*self.callbacks.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn callbacks_mut(&self) -> &mut CallbackList {
        &mut *self.callbacks.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn flags(&self) -> HandleFlags {
        *self.flags.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn flags_mut(&self) -> &mut HandleFlags {
        &mut *self.flags.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn iovec_data_len(&self) -> u8 {
        *self.iovec_data_len.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn set_iovec_data_len(&self, len: u8) {
        *self.iovec_data_len.get() = len;
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn bounce_head(&self) -> u32 {
        *self.bounce_head.get()
    }

    /// SAFETY: caller must be the handle's current protocol owner.
    pub(crate) unsafe fn set_bounce_head(&self, head: u32) {
        *self.bounce_head.get() = head;
    }

    /// SAFETY: caller must be the handle's owning backend.
    pub(crate) unsafe fn has_resowner(&self) -> bool {
        *self.has_resowner.get()
    }

    /// SAFETY: caller must be the handle's owning backend.
    pub(crate) unsafe fn set_has_resowner(&self, value: bool) {
        *self.has_resowner.get() = value;
    }

    /// SAFETY: caller must be the handle's owning backend.
    pub(crate) unsafe fn has_report(&self) -> bool {
        *self.has_report.get()
    }

    /// SAFETY: caller must be the handle's owning backend.
    pub(crate) unsafe fn set_has_report(&self, value: bool) {
        *self.has_report.get() = value;
    }

    /// Wakes every waiter on this handle. The mutex round trip pairs with
    /// the re-check waiters perform under the same mutex, so no wakeup is
    /// lost between their state check and their sleep.
    pub(crate) fn broadcast(&self) {
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Sleeps until the referenced incarnation leaves the processing states
    /// (`Defined`, `Prepared`, `InFlight`, `Reaped`) or is recycled.
    /// Returns the observation that ended the sleep.
    pub(crate) fn sleep_while_processing(&self, ref_generation: u64) -> Observed {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            let observed = self.state.observe(ref_generation);
            match observed {
                Observed::Recycled => return observed,
                Observed::Live(
                    HandleState::Defined
                    | HandleState::Prepared
                    | HandleState::InFlight
                    | HandleState::Reaped,
                ) => {
                    guard = self.condvar.wait(guard).unwrap();
                }
                Observed::Live(_) => return observed,
            }
        }
    }
}

/// Log-safe handle description: id, op, subject, state.
pub(crate) struct HandleDesc<'a> {
    pub index: u32,
    pub handle: &'a Handle,
}

impl fmt::Display for HandleDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: a HandleDesc is only constructed at engine log sites where
        // the logging party is the handle's current protocol owner.
        let (op, subject) = unsafe { (self.handle.op_data().name(), self.handle.subject()) };
        write!(
            f,
            "io:{} op {} subject {} state {}",
            self.index,
            op,
            subject.name(),
            self.handle.state.state().name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_list_runs_in_reverse_registration_order() {
        let mut list = CallbackList::default();
        list.push(SharedCallbackId::FILE_BLOCK);
        list.push(SharedCallbackId::PAGE_VERIFY);
        let order: Vec<_> = list.reversed().collect();
        assert_eq!(
            order,
            vec![SharedCallbackId::PAGE_VERIFY, SharedCallbackId::FILE_BLOCK]
        );
    }

    #[test]
    #[should_panic(expected = "too many shared callbacks")]
    fn callback_list_overflow_panics() {
        let mut list = CallbackList::default();
        for _ in 0..=MAX_SHARED_CALLBACKS {
            list.push(SharedCallbackId::FILE_BLOCK);
        }
    }

    #[test]
    fn invalid_ref_is_recognizable() {
        assert!(!IoRef::INVALID.is_valid());
        assert!(IoRef::new(3, 1).is_valid());
    }
}
