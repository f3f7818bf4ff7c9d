//! Asynchronous block I/O engine with adaptive read streams.
//!
//! Two tightly coupled layers:
//!
//! - **The engine**: a shared pool of I/O handles with a strict state
//!   machine, per-backend submission batches, generation-checked
//!   references for cross-backend waiting, shared completion callbacks
//!   identified by integer ids, bounce buffers, resource-owner lifetime
//!   binding, and a pluggable submission method (inline, worker threads,
//!   io_uring, POSIX AIO).
//! - **The read stream**: an adaptive look-ahead reader on top. A callback
//!   yields block numbers; the stream coalesces neighbors into vectored
//!   reads, issues prefetch advice for random access, self-tunes its
//!   look-ahead distance, and hands pinned buffers to the consumer in
//!   exactly the order asked for.
//!
//! High-level flow (one read):
//! 1) Acquire a handle from the backend's slice (blocking only when the
//!    slice is exhausted).
//! 2) Define it: subject, callbacks, iovecs, then `stage_readv`. None of
//!    this allocates or blocks, so I/O is issuable from critical sections.
//! 3) Batched submission moves it in flight; any backend can wait on the
//!    (index, generation) reference.
//! 4) Whoever reaps it runs the callback chain, publishes the distilled
//!    result, and wakes waiters; the owner reclaims the slot.
//!
//! The crate targets unix; the io_uring method is Linux-only.

pub mod bounce;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod resowner;
pub mod result;
pub mod state;
pub mod stream;

mod method;
mod ops;

pub use bounce::BounceBuf;
pub use config::{DirectIoFlags, EngineConfig, IoMethodKind};
pub use engine::{AcquiredHandle, Backend, EngineControl};
pub use error::{ConfigError, IoFailure, StreamError};
pub use handle::{HandleFlags, IoRef};
pub use registry::{raise_error, SharedCallbackId, SubjectId};
pub use resowner::ResourceOwner;
pub use result::{IoResult, IoResultStatus, IoReturn, IoReturnCell, SubjectData};
pub use stream::file_source::FileBlockSource;
pub use stream::source::{BlockSource, StartReadFlags, StartReadOutcome};
pub use stream::{ReadStream, StreamFlags, StreamOptions};

/// Bytes per block; every page-sized transfer is a multiple of this.
pub const BLOCK_SIZE: usize = 8192;

/// Alignment of bounce buffers (direct-I/O friendly).
pub const BLOCK_ALIGN: usize = 4096;

/// Block number within a file. Streams express "no more blocks" as `None`
/// rather than a sentinel value.
pub type BlockNumber = u32;

/// A pinned buffer-pool page, as named by a [`BlockSource`].
///
/// The engine never interprets the value; sources map it to whatever their
/// pinning machinery uses (the file-backed source uses cache frame ids).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Buffer(u32);

impl Buffer {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}
