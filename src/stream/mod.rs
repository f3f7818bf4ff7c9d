//! Buffered block access with adaptive look-ahead.
//!
//! Client code supplies a callback that yields the block numbers it wants,
//! one at a time, and pulls pinned buffers out of the stream in exactly
//! that order. Behind the consumer's back, the stream looks into the
//! future: consecutive blocks coalesce into vectored reads of up to
//! `buffer_io_size` blocks, and the look-ahead distance adapts to what the
//! stream observes:
//!
//! - **A** — everything is cached: look-ahead is useless, distance decays
//!   to 1.
//! - **B** — I/O is needed but sequential: kernel read-ahead beats advice,
//!   so distance grows only to the largest physical read size, enough to
//!   coalesce full transfers.
//! - **C** — I/O is needed and random: distance grows toward the
//!   configured I/O concurrency so several reads can run at once.
//!
//! Distance doubles whenever a consumed buffer turned out to need I/O and
//! decays by one whenever it was cache-resident, so the stream migrates
//! between regimes as the access pattern changes.
//!
//! The queue is a circular array of ranges; the head range grows by
//! look-ahead and the tail range drains into the consumer:
//!
//! ```text
//!     +------------+
//!     | 10..25     | <- tail range (buffers handed to the consumer next)
//!     +------------+
//!     | 26..27     |
//!     +------------+
//!     | 42..42     | <- head range (extended by look-ahead)
//!     +------------+
//! ```

pub mod file_source;
pub mod source;

use crate::config::{EngineConfig, MAX_IO_COMBINE};
use crate::error::StreamError;
use crate::{BlockNumber, Buffer};

use self::source::{BlockSource, StartReadFlags};

/// Stream behavior hints supplied at `begin`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
    bits: u8,
}

impl StreamFlags {
    pub const NONE: Self = Self { bits: 0 };
    /// The caller promises strictly sequential access; advice is useless.
    pub const SEQUENTIAL: Self = Self { bits: 1 };
    /// The whole relation will be read; skip the ramp-up phase.
    pub const FULL: Self = Self { bits: 2 };
    /// Maintenance work; uses the maintenance I/O concurrency ceiling.
    pub const MAINTENANCE: Self = Self { bits: 4 };

    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

/// Resolved stream limits.
#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    pub flags: StreamFlags,
    /// Reads allowed in flight at once. 0 behaves as 1 with advice off.
    pub max_ios: u32,
    /// Blocks per physical transfer.
    pub buffer_io_size: u32,
    /// This consumer's share of the pin budget.
    pub pin_budget: u32,
    /// Whether prefetch advice is possible at all (false under direct I/O).
    pub advice_capable: bool,
}

impl StreamOptions {
    /// Derives stream limits from the engine configuration.
    pub fn from_engine(config: &EngineConfig, flags: StreamFlags, pin_budget: u32) -> Self {
        let max_ios = if flags.contains(StreamFlags::MAINTENANCE) {
            config.maintenance_io_concurrency
        } else {
            config.effective_io_concurrency
        };
        Self {
            flags,
            max_ios,
            buffer_io_size: config.buffer_io_size,
            pin_budget,
            advice_capable: config.advice_capable(),
        }
    }
}

/// One element of the circular range queue: a run of neighboring blocks
/// covered by (at most) one physical read.
struct Range<Op> {
    blocknum: BlockNumber,
    nblocks: u32,
    /// Outstanding read; present until waited for.
    op: Option<Op>,
    /// The read was started with prefetch advice requested.
    advice_issued: bool,
    per_buffer_data_index: u32,
    buffers: Box<[Buffer]>,
}

impl<Op> Range<Op> {
    fn new(buffer_io_size: u32) -> Self {
        Self {
            blocknum: 0,
            nblocks: 0,
            op: None,
            advice_issued: false,
            per_buffer_data_index: 0,
            buffers: (0..buffer_io_size).map(|_| Buffer::new(0)).collect(),
        }
    }
}

/// Adaptive look-ahead reader over a [`BlockSource`].
///
/// `D` is optional per-buffer data: the callback writes a `D` alongside
/// each block it emits and the consumer receives it with the buffer.
pub struct ReadStream<S: BlockSource, D, F> {
    source: S,
    callback: F,

    max_ios: u32,
    ios_in_progress: u32,
    max_pinned_buffers: u32,
    pinned_buffers: u32,
    buffer_io_size: u32,

    distance: u32,
    started: bool,
    finished: bool,
    advice_enabled: bool,

    /// One block pushed back for flow control, with its data slot for the
    /// cross-check that the slot assignment is stable across the unget.
    unget: Option<(BlockNumber, u32)>,
    /// Next block of a strictly sequential continuation.
    seq_blocknum: BlockNumber,

    per_buffer_data: Box<[D]>,

    size: u32,
    head: u32,
    tail: u32,
    next_tail_buffer: u32,
    ranges: Box<[Range<S::Op>]>,
}

impl<S, D, F> ReadStream<S, D, F>
where
    S: BlockSource,
    D: Default,
    F: FnMut(&mut D) -> Option<BlockNumber>,
{
    /// Creates a stream over `source` that will read the blocks `callback`
    /// yields, in order, until it returns `None`.
    pub fn begin(source: S, options: &StreamOptions, callback: F) -> Result<Self, StreamError> {
        let buffer_io_size = options.buffer_io_size.clamp(1, MAX_IO_COMBINE as u32);

        // max_ios == 0 means "no concurrency": one read at a time, advice
        // pointless.
        let (max_ios, advice_capable) = if options.max_ios == 0 {
            (1, false)
        } else {
            (options.max_ios, options.advice_capable)
        };
        let advice_enabled =
            advice_capable && !options.flags.contains(StreamFlags::SEQUENTIAL);

        if options.pin_budget == 0 {
            return Err(StreamError::PinBudgetTooSmall);
        }
        // Enough room to build one full-sized read even with max_ios == 1,
        // clamped to this consumer's pin share.
        let max_pinned_buffers = (4 * max_ios)
            .max(buffer_io_size)
            .min(options.pin_budget)
            .max(1);

        // Circular queue: when empty, head == tail; when full, one empty
        // element separates them. Worst case is one range per pinned
        // buffer plus the growing head range.
        let size = max_pinned_buffers + 2;

        let distance = if options.flags.contains(StreamFlags::FULL) {
            buffer_io_size.min(max_pinned_buffers)
        } else {
            1
        };

        Ok(Self {
            source,
            callback,
            max_ios,
            ios_in_progress: 0,
            max_pinned_buffers,
            pinned_buffers: 0,
            buffer_io_size,
            distance,
            started: false,
            finished: false,
            advice_enabled,
            unget: None,
            seq_blocknum: 0,
            per_buffer_data: (0..size).map(|_| D::default()).collect(),
            size,
            head: 0,
            tail: 0,
            next_tail_buffer: 0,
            ranges: (0..size).map(|_| Range::new(buffer_io_size)).collect(),
        })
    }

    /// Data slot for the n-th block of a range. Slots advance with the
    /// blocks, modulo the queue size, so every outstanding block has a
    /// distinct slot plus one spare for the buffer just handed out.
    fn data_index(&self, range: u32, n: u32) -> u32 {
        let mut index = self.ranges[range as usize].per_buffer_data_index + n;
        while index >= self.size {
            index -= self.size;
        }
        index
    }

    /// Asks the callback (or the unget register) for the next block.
    fn get_block(&mut self, data_index: u32) -> Option<BlockNumber> {
        if let Some((blocknum, unget_index)) = self.unget.take() {
            // The callback already wrote this slot; the index math lands on
            // the same slot after any range split.
            debug_assert_eq!(data_index, unget_index);
            return Some(blocknum);
        }
        (self.callback)(&mut self.per_buffer_data[data_index as usize])
    }

    /// Defers a block to the next look-ahead pass. Must be the last value
    /// returned by [`ReadStream::get_block`].
    fn unget_block(&mut self, blocknum: BlockNumber, data_index: u32) {
        debug_assert!(self.unget.is_none());
        self.unget = Some((blocknum, data_index));
    }

    /// Starts reading the head range and opens a fresh head. If the source
    /// accepted only a prefix, the remainder becomes the new head range.
    fn start_head_range(&mut self) {
        debug_assert!(self.ios_in_progress < self.max_ios);
        let head = self.head as usize;
        let nblocks = self.ranges[head].nblocks;
        debug_assert!(nblocks > 0);

        // Random jumps get advice; sequential continuations rely on kernel
        // read-ahead, and the very first read is always too late to help.
        let issue_advice = self.advice_enabled
            && self.started
            && self.ranges[head].blocknum != self.seq_blocknum;
        self.started = true;

        debug_assert!(self.pinned_buffers + nblocks <= self.max_pinned_buffers);

        let range = &mut self.ranges[head];
        let outcome = self.source.start_read_blocks(
            range.blocknum,
            &mut range.buffers[..nblocks as usize],
            StartReadFlags { issue_advice },
        );
        let accepted = outcome.accepted as u32;
        assert!(accepted >= 1 && accepted <= nblocks);

        range.op = outcome.wait;
        range.advice_issued = range.op.is_some() && issue_advice;
        if range.op.is_some() {
            self.ios_in_progress += 1;
            debug_assert!(self.ios_in_progress <= self.max_ios);
        }

        let base = range.blocknum;
        self.pinned_buffers += accepted;
        self.seq_blocknum = base + accepted;

        // Open the new head. There is always room: the queue holds one
        // element per pinned buffer plus the growing head plus a spare.
        debug_assert!((self.head + 1) % self.size != self.tail);
        self.head = (self.head + 1) % self.size;
        let data_index = self.data_index(head as u32, accepted);

        let remaining = nblocks - accepted;
        self.ranges[head].nblocks = accepted;

        let new_head = &mut self.ranges[self.head as usize];
        new_head.op = None;
        new_head.advice_issued = false;
        new_head.per_buffer_data_index = data_index;
        new_head.nblocks = remaining;
        if remaining > 0 {
            new_head.blocknum = base + accepted;
        }
    }

    /// Fills the pipeline: consumes block numbers while the distance and
    /// I/O limits allow, extending the head range or starting reads.
    fn look_ahead(&mut self) {
        if self.finished {
            return;
        }
        if self.ios_in_progress == self.max_ios {
            return;
        }
        if self.pinned_buffers >= self.distance {
            return;
        }

        while self.pinned_buffers + self.ranges[self.head as usize].nblocks < self.distance {
            // A full-sized head range must be submitted before the next
            // block may even be asked for.
            if self.ranges[self.head as usize].nblocks == self.buffer_io_size {
                self.start_head_range();
                if self.ios_in_progress == self.max_ios {
                    return;
                }
                debug_assert!(
                    self.ranges[self.head as usize].nblocks < self.buffer_io_size
                );
            }

            let data_index =
                self.data_index(self.head, self.ranges[self.head as usize].nblocks);
            let Some(blocknum) = self.get_block(data_index) else {
                self.finished = true;
                self.distance = 0;
                break;
            };

            let head = self.head as usize;
            let extends = {
                let range = &self.ranges[head];
                range.nblocks == 0 || range.blocknum + range.nblocks == blocknum
            };
            if !extends {
                // Discontiguous: flush the head range (and any split
                // remainders) so a new one can start at `blocknum`.
                self.start_head_range();
                while self.ranges[self.head as usize].nblocks > 0
                    && self.ios_in_progress < self.max_ios
                {
                    self.start_head_range();
                }
                if self.ios_in_progress == self.max_ios {
                    // Out of I/O capacity (possibly with a split remainder
                    // still pending); hand the block back for the next
                    // pass.
                    self.unget_block(blocknum, data_index);
                    return;
                }
            }

            let range = &mut self.ranges[self.head as usize];
            if range.nblocks == 0 {
                range.blocknum = blocknum;
            }
            debug_assert_eq!(range.blocknum + range.nblocks, blocknum);
            range.nblocks += 1;
        }

        // Normally the head range is left to grow toward a full transfer,
        // but when it cannot grow further there is no reason to wait.
        let head_nblocks = self.ranges[self.head as usize].nblocks;
        if head_nblocks > 0 && (self.finished || head_nblocks == self.distance) {
            self.start_head_range();
        }
    }

    /// Regime B/C distance update after a consumed buffer needed I/O.
    fn distance_after_io(&mut self, advice_issued: bool) {
        if advice_issued {
            // Regime C: ramp toward the I/O concurrency ceiling.
            self.distance = (self.distance * 2).min(self.max_pinned_buffers);
        } else if self.distance > self.buffer_io_size {
            // Regime B: decay gently toward the full transfer size.
            self.distance -= 1;
        } else {
            // Regime B ramp-up, capped at the full transfer size.
            self.distance = (self.distance * 2)
                .min(self.buffer_io_size)
                .min(self.max_pinned_buffers);
        }
    }

    /// Single-buffer fast path: a steady fully-cached stream with no
    /// per-buffer data reuses one queue slot instead of rotating the
    /// queue. Returns the consumed buffer, with the slot already refilled.
    fn next_fast(&mut self) -> Option<Buffer> {
        if std::mem::size_of::<D>() != 0
            || self.finished
            || self.unget.is_some()
            || self.distance != 1
            || self.pinned_buffers != 1
            || self.ios_in_progress != 0
            || self.next_tail_buffer != 0
            || (self.tail + 1) % self.size != self.head
        {
            return None;
        }
        {
            let tail = &self.ranges[self.tail as usize];
            if tail.op.is_some() || tail.nblocks != 1 {
                return None;
            }
            if self.ranges[self.head as usize].nblocks != 0 {
                return None;
            }
        }

        let tail = self.tail as usize;
        let buffer = self.ranges[tail].buffers[0];
        self.pinned_buffers = 0;
        // Cache residency observed: regular regime-A decay is a no-op at
        // distance 1.

        let data_index = self.ranges[tail].per_buffer_data_index;
        match self.get_block(data_index) {
            Some(blocknum) => {
                let range = &mut self.ranges[tail];
                range.blocknum = blocknum;
                range.nblocks = 1;
                let outcome = self.source.start_read_blocks(
                    blocknum,
                    &mut range.buffers[..1],
                    StartReadFlags::default(),
                );
                debug_assert_eq!(outcome.accepted, 1);
                range.op = outcome.wait;
                range.advice_issued = false;
                if range.op.is_some() {
                    // A miss: the generic path takes over from here.
                    self.ios_in_progress += 1;
                }
                self.pinned_buffers = 1;
                self.seq_blocknum = blocknum + 1;
                self.started = true;
            }
            None => {
                self.finished = true;
                self.distance = 0;
                self.ranges[tail].nblocks = 0;
                self.tail = self.head;
                self.next_tail_buffer = 0;
            }
        }
        Some(buffer)
    }

    /// Pulls the next buffer out of the stream, in callback order, waiting
    /// for its read to finish if one is outstanding. Returns `None` once
    /// the stream is exhausted.
    pub fn next(&mut self) -> Option<(Buffer, &mut D)> {
        // Rotate out a fully consumed tail range up front, so the fast
        // path sees the live one.
        if self.tail != self.head {
            let t = &self.ranges[self.tail as usize];
            if t.op.is_none() && t.nblocks > 0 && self.next_tail_buffer == t.nblocks {
                self.tail = (self.tail + 1) % self.size;
                self.next_tail_buffer = 0;
            }
        }

        if let Some(buffer) = self.next_fast() {
            let spare = self.data_index(self.tail, self.buffer_io_size);
            return Some((buffer, &mut self.per_buffer_data[spare as usize]));
        }

        loop {
            if self.tail != self.head {
                let tail = self.tail as usize;

                if self.ranges[tail].op.is_some() {
                    debug_assert_eq!(self.next_tail_buffer, 0);
                    let op = self.ranges[tail].op.take().expect("checked above");
                    self.source.wait_read_blocks(op);
                    debug_assert!(self.ios_in_progress > 0);
                    self.ios_in_progress -= 1;
                    let advice_issued = self.ranges[tail].advice_issued;
                    self.distance_after_io(advice_issued);
                } else if self.next_tail_buffer == 0 && self.distance > 1 {
                    // Regime A: cache-resident head buffer, decay by one.
                    self.distance -= 1;
                }

                if self.next_tail_buffer < self.ranges[tail].nblocks {
                    let i = self.next_tail_buffer;
                    self.next_tail_buffer += 1;
                    let buffer = self.ranges[tail].buffers[i as usize];

                    debug_assert!(self.pinned_buffers > 0);
                    self.pinned_buffers -= 1;
                    let data_index = self.data_index(self.tail, i);

                    // The consumer taking a buffer may unblock more I/O.
                    self.look_ahead();

                    return Some((buffer, &mut self.per_buffer_data[data_index as usize]));
                }

                self.tail = (self.tail + 1) % self.size;
                self.next_tail_buffer = 0;
            } else if self.ranges[self.head as usize].nblocks > 0 {
                // The consumer caught up with a still-growing head range;
                // start it rather than make them wait for it to fill.
                self.start_head_range();
            } else {
                self.look_ahead();
                if self.tail == self.head && self.ranges[self.head as usize].nblocks == 0 {
                    break;
                }
            }
        }

        debug_assert_eq!(self.pinned_buffers, 0);
        None
    }

    /// The source, e.g. to release a consumed buffer.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn ios_in_progress(&self) -> u32 {
        self.ios_in_progress
    }

    pub fn pinned_buffers(&self) -> u32 {
        self.pinned_buffers
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }

    /// Ends the stream: releases everything that was pinned ahead and
    /// returns the source.
    pub fn end(mut self) -> S {
        self.finished = true;
        self.unget = None;
        loop {
            let buffer = match self.next() {
                Some((buffer, _)) => buffer,
                None => break,
            };
            self.source.release_buffer(buffer);
        }
        debug_assert_eq!(self.pinned_buffers, 0);
        debug_assert_eq!(self.ios_in_progress, 0);
        self.source
    }
}
