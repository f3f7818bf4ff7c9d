//! Shared test support: a scripted block source that records every
//! physical read the stream asks for.

use std::collections::HashSet;

use blockio::{BlockNumber, BlockSource, Buffer, StartReadFlags, StartReadOutcome};

/// One recorded physical read.
#[derive(Clone, Copy, Debug)]
pub struct ReadRecord {
    pub blocknum: BlockNumber,
    pub nblocks: usize,
    pub advice: bool,
}

/// Wait token handed back by the mock.
pub struct MockOp {
    #[allow(dead_code)]
    pub read_index: usize,
}

/// Scripted [`BlockSource`]: residency comes from a set, reads are
/// recorded, buffers are named after their block numbers so consumers can
/// assert ordering directly.
pub struct MockSource {
    pub cached: HashSet<BlockNumber>,
    /// Cap on blocks accepted per start call (models partial accepts).
    pub accept_limit: usize,
    pub reads: Vec<ReadRecord>,
    pub waits: usize,
    pub outstanding_pins: u64,
    pub outstanding_ios: usize,
    pub max_outstanding_ios: usize,
}

impl MockSource {
    pub fn new(cached: impl IntoIterator<Item = BlockNumber>) -> Self {
        Self {
            cached: cached.into_iter().collect(),
            accept_limit: usize::MAX,
            reads: Vec::new(),
            waits: 0,
            outstanding_pins: 0,
            outstanding_ios: 0,
            max_outstanding_ios: 0,
        }
    }

    pub fn total_blocks_read(&self) -> usize {
        self.reads.iter().map(|r| r.nblocks).sum()
    }
}

impl BlockSource for MockSource {
    type Op = MockOp;

    fn start_read_blocks(
        &mut self,
        blocknum: BlockNumber,
        buffers: &mut [Buffer],
        flags: StartReadFlags,
    ) -> StartReadOutcome<MockOp> {
        let limit = buffers.len().min(self.accept_limit).max(1);

        if self.cached.contains(&blocknum) {
            let mut accepted = 0;
            while accepted < limit && self.cached.contains(&(blocknum + accepted as u32)) {
                buffers[accepted] = Buffer::new(blocknum + accepted as u32);
                accepted += 1;
            }
            self.outstanding_pins += accepted as u64;
            return StartReadOutcome {
                accepted,
                wait: None,
            };
        }

        let mut accepted = 0;
        while accepted < limit && !self.cached.contains(&(blocknum + accepted as u32)) {
            buffers[accepted] = Buffer::new(blocknum + accepted as u32);
            accepted += 1;
        }
        for i in 0..accepted {
            // Resident once the read completes; repeats of the same block
            // hit the cache path.
            self.cached.insert(blocknum + i as u32);
        }
        self.outstanding_pins += accepted as u64;
        self.reads.push(ReadRecord {
            blocknum,
            nblocks: accepted,
            advice: flags.issue_advice,
        });
        self.outstanding_ios += 1;
        self.max_outstanding_ios = self.max_outstanding_ios.max(self.outstanding_ios);
        StartReadOutcome {
            accepted,
            wait: Some(MockOp {
                read_index: self.reads.len() - 1,
            }),
        }
    }

    fn wait_read_blocks(&mut self, _op: MockOp) {
        self.waits += 1;
        assert!(self.outstanding_ios > 0);
        self.outstanding_ios -= 1;
    }

    fn release_buffer(&mut self, _buffer: Buffer) {
        assert!(self.outstanding_pins > 0);
        self.outstanding_pins -= 1;
    }
}

/// Callback over a fixed script of block numbers.
pub fn script(blocks: Vec<BlockNumber>) -> impl FnMut(&mut ()) -> Option<BlockNumber> {
    let mut iter = blocks.into_iter();
    move |_| iter.next()
}
