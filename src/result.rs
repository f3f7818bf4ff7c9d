//! Distilled I/O results.
//!
//! Completion callbacks run in whatever backend reaps the I/O, so they can
//! only leave behind plain data: a status, the id of the callback that
//! produced the status, and 32 bits of error detail, packed into one `u64`
//! that fits the handle's atomic storage. Heap-allocated error objects are
//! reconstructed lazily, by the issuer, through the callback's error hook
//! (see [`crate::registry`]).

use std::sync::Mutex;

use crate::registry::SharedCallbackId;

/// Outcome classification of a distilled result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IoResultStatus {
    /// Not yet distilled.
    Unknown = 0,
    /// Success. The transfer may still be short; check the result count.
    Ok = 1,
    /// Fewer bytes transferred than requested.
    Short = 2,
    /// The operating system reported an error; `error_data` is the errno.
    IoError = 3,
    /// A completion callback rejected the data (e.g. page verification).
    Invalid = 4,
}

impl IoResultStatus {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Unknown,
            1 => Self::Ok,
            2 => Self::Short,
            3 => Self::IoError,
            4 => Self::Invalid,
            other => unreachable!("corrupt result status {other}"),
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::IoError | Self::Invalid)
    }
}

/// Distilled result of one I/O, produced by the completion callback chain.
///
/// `result` starts as the raw method result (negative errno on failure,
/// otherwise the byte count) and each callback in the chain may replace it
/// with something more meaningful to the layer above.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoResult {
    pub status: IoResultStatus,
    /// The callback whose error hook can explain this result.
    pub id: SharedCallbackId,
    /// Status-specific detail: errno, short-read block index, etc.
    pub error_data: u32,
    pub result: i32,
}

impl IoResult {
    /// The chain's starting value: the raw result, considered OK at the
    /// lowest level.
    pub fn from_raw(raw: i32) -> Self {
        Self {
            status: IoResultStatus::Ok,
            id: SharedCallbackId::INVALID,
            error_data: 0,
            result: raw,
        }
    }

    /// Packs status, id and error data into the handle's atomic word.
    pub fn pack(self) -> (u64, i32) {
        let word = (self.status as u64) << 40
            | u64::from(self.id.as_u8()) << 32
            | u64::from(self.error_data);
        (word, self.result)
    }

    pub fn unpack(word: u64, result: i32) -> Self {
        Self {
            status: IoResultStatus::from_bits(word >> 40 & 0x7),
            id: SharedCallbackId::from_u8((word >> 32 & 0xff) as u8),
            error_data: (word & 0xffff_ffff) as u32,
            result,
        }
    }
}

/// Subject-specific payload carried by a handle, opaque to the engine.
///
/// Two words are enough for the subjects in this crate (block number plus
/// block count, say); subjects define the encoding. Lives in the handle and
/// is copied into the issuer's [`IoReturn`] at reclaim, so error hooks can
/// describe the failed operation long after the handle was recycled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubjectData {
    pub words: [u64; 2],
}

/// What the issuer gets back when its handle is reclaimed.
#[derive(Clone, Copy, Debug)]
pub struct IoReturn {
    pub result: IoResult,
    pub subject_data: SubjectData,
}

/// Caller-owned slot that receives the [`IoReturn`] at reclaim.
///
/// Reclaim happens on the owning backend's thread, but the cell may be read
/// from wherever the issuer's control flow ended up; a mutex keeps this safe
/// and the lock is never contended on a hot path.
#[derive(Default)]
pub struct IoReturnCell {
    slot: Mutex<Option<IoReturn>>,
}

impl IoReturnCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ret: IoReturn) {
        *self.slot.lock().unwrap() = Some(ret);
    }

    /// Takes the reported result, leaving the cell empty.
    pub fn take(&self) -> Option<IoReturn> {
        self.slot.lock().unwrap().take()
    }
}
