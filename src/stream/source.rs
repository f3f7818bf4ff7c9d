//! The block-source collaborator interface the read stream drives.
//!
//! The stream does not pin pages or issue reads itself; it coalesces block
//! numbers into ranges and hands them to a [`BlockSource`], which owns the
//! cache-residency check, pinning, and the physical read (usually through
//! the AIO engine — see [`super::file_source::FileBlockSource`]).

use crate::{BlockNumber, Buffer};

/// Flags for one `start_read_blocks` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct StartReadFlags {
    /// The stream classified the access as random and wants prefetch
    /// advice issued for the range rather than kernel read-ahead.
    pub issue_advice: bool,
}

/// What `start_read_blocks` did with a requested range.
#[derive(Debug)]
pub struct StartReadOutcome<Op> {
    /// Blocks actually pinned, from the front of the range. At least 1 for
    /// a nonempty request, possibly fewer than asked (the stream moves the
    /// remainder into a new pending range).
    pub accepted: usize,
    /// Present when a physical read was started: the token to pass to
    /// `wait_read_blocks` before the range's buffers may be consumed.
    pub wait: Option<Op>,
}

/// A provider of pinned, cache-resident block buffers.
pub trait BlockSource {
    /// Token representing one started read.
    type Op;

    /// Pins buffers for a prefix of `buffers.len()` blocks starting at
    /// `blocknum`, filling `buffers[..accepted]`. Blocks already resident
    /// need no wait; otherwise a read is started (or advice issued) and a
    /// wait token returned.
    fn start_read_blocks(
        &mut self,
        blocknum: BlockNumber,
        buffers: &mut [Buffer],
        flags: StartReadFlags,
    ) -> StartReadOutcome<Self::Op>;

    /// Completes a started read; afterwards every buffer the corresponding
    /// `start_read_blocks` accepted is valid.
    fn wait_read_blocks(&mut self, op: Self::Op);

    /// Returns a pinned buffer the consumer is done with.
    fn release_buffer(&mut self, buffer: Buffer);
}
