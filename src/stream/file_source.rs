//! File-backed block source with a small page cache.
//!
//! This is the concrete [`BlockSource`] the integration tests stream from:
//! a plain file of checksummed blocks, a fixed arena of cache frames, and
//! misses read through the AIO engine (vectored reads straight into the
//! frames, page verification in the completion chain). It also hosts the
//! built-in subject and shared-callback hooks for file-block I/O, including
//! the write path that stamps checksums into bounce buffers.
//!
//! It deliberately stays a collaborator demonstration: no eviction policy
//! worth the name, no concurrent pinning protocol, one file.

use std::fmt;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use crate::engine::Backend;
use crate::error::IoFailure;
use crate::handle::IoRef;
use crate::registry::{raise_error, IoContext, SharedCallbackId, SharedCallbacks, SubjectId};
use crate::result::{IoResult, IoResultStatus, IoReturnCell, SubjectData};
use crate::stream::source::{BlockSource, StartReadFlags, StartReadOutcome};
use crate::{BlockNumber, Buffer, BLOCK_SIZE};

const NO_BLOCK: BlockNumber = BlockNumber::MAX;

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(1);

// ----------------------------------------------------------------------
// Page checksums
// ----------------------------------------------------------------------

const PAGE_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Bytes 0..4 of a page hold the checksum of the rest.
pub fn page_checksum(page: &[u8]) -> u32 {
    debug_assert_eq!(page.len(), BLOCK_SIZE);
    PAGE_CRC.checksum(&page[4..])
}

/// Stamps the checksum into a page in place.
pub fn stamp_page(page: &mut [u8]) {
    let sum = page_checksum(page);
    page[..4].copy_from_slice(&sum.to_le_bytes());
}

/// Checks a page against its stamped checksum.
pub fn verify_page(page: &[u8]) -> bool {
    let stored = u32::from_le_bytes(page[..4].try_into().expect("page header"));
    stored == page_checksum(page)
}

// ----------------------------------------------------------------------
// Subject data encoding
// ----------------------------------------------------------------------

/// Packs (start block, block count, file id) into the handle's subject data.
pub(crate) fn encode_subject(blocknum: BlockNumber, nblocks: u32, file_id: u32) -> SubjectData {
    SubjectData {
        words: [u64::from(blocknum) | (u64::from(nblocks) << 32), u64::from(file_id)],
    }
}

fn decode_subject(data: &SubjectData) -> (BlockNumber, u32, u32) {
    (
        (data.words[0] & 0xffff_ffff) as u32,
        (data.words[0] >> 32) as u32,
        data.words[1] as u32,
    )
}

pub(crate) fn describe_file_block(data: &SubjectData, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (blocknum, nblocks, file_id) = decode_subject(data);
    write!(
        f,
        "blocks {}..{} of file {}",
        blocknum,
        blocknum + nblocks,
        file_id
    )
}

// ----------------------------------------------------------------------
// Shared callbacks
// ----------------------------------------------------------------------

/// Media layer: classifies the raw result.
fn file_block_complete(cx: &IoContext<'_>, prev: IoResult) -> IoResult {
    if prev.status != IoResultStatus::Ok {
        return prev;
    }
    let raw = prev.result;
    if raw < 0 {
        return IoResult {
            status: IoResultStatus::IoError,
            id: SharedCallbackId::FILE_BLOCK,
            error_data: (-raw) as u32,
            result: raw,
        };
    }
    let expected = cx.requested_bytes();
    if (raw as u64) < expected {
        return IoResult {
            status: IoResultStatus::Short,
            id: SharedCallbackId::FILE_BLOCK,
            // Whole blocks actually transferred.
            error_data: raw as u32 / BLOCK_SIZE as u32,
            result: raw,
        };
    }
    prev
}

fn file_block_error(result: &IoResult, subject_data: &SubjectData) -> IoFailure {
    let (blocknum, nblocks, file_id) = decode_subject(subject_data);
    match result.status {
        IoResultStatus::IoError => IoFailure::with_errno(
            format!(
                "could not transfer blocks {}..{} of file {}",
                blocknum,
                blocknum + nblocks,
                file_id
            ),
            result.error_data as i32,
        ),
        IoResultStatus::Short => IoFailure::new(format!(
            "short transfer on blocks {}..{} of file {}: {} of {} blocks",
            blocknum,
            blocknum + nblocks,
            file_id,
            result.error_data,
            nblocks
        )),
        _ => IoFailure::new(format!(
            "I/O failure on blocks {}..{} of file {}",
            blocknum,
            blocknum + nblocks,
            file_id
        )),
    }
}

pub(crate) const FILE_BLOCK_CALLBACKS: SharedCallbacks = SharedCallbacks {
    prepare: None,
    complete: Some(file_block_complete),
    error: Some(file_block_error),
};

/// Verifies page checksums after a fully successful read. Runs before the
/// media callback in the chain, so raw failures pass through untouched.
fn page_verify_complete(cx: &IoContext<'_>, prev: IoResult) -> IoResult {
    if prev.status != IoResultStatus::Ok || prev.result < 0 {
        return prev;
    }
    let complete_blocks = (prev.result as usize / BLOCK_SIZE).min(cx.op().iov_count() as usize);
    let io_data = cx.io_data();
    for i in 0..complete_blocks {
        if !verify_page(cx.iovec_bytes(i)) {
            let blocknum = io_data.get(i).copied().unwrap_or(0) as u32;
            return IoResult {
                status: IoResultStatus::Invalid,
                id: SharedCallbackId::PAGE_VERIFY,
                error_data: blocknum,
                result: prev.result,
            };
        }
    }
    prev
}

fn page_verify_error(result: &IoResult, subject_data: &SubjectData) -> IoFailure {
    let (_, _, file_id) = decode_subject(subject_data);
    IoFailure::new(format!(
        "invalid page in block {} of file {}",
        result.error_data, file_id
    ))
}

pub(crate) const PAGE_VERIFY_CALLBACKS: SharedCallbacks = SharedCallbacks {
    prepare: None,
    complete: Some(page_verify_complete),
    error: Some(page_verify_error),
};

/// Stamps checksums into the staged pages at define time (the pages sit in
/// bounce buffers owned by the handle, so the stamp cannot race the caller).
fn page_stamp_prepare(cx: &IoContext<'_>) {
    for i in 0..cx.op().iov_count() as usize {
        cx.with_iovec_bytes_mut(i, stamp_page);
    }
}

fn page_stamp_complete(_cx: &IoContext<'_>, prev: IoResult) -> IoResult {
    prev
}

pub(crate) const PAGE_STAMP_CALLBACKS: SharedCallbacks = SharedCallbacks {
    prepare: Some(page_stamp_prepare),
    complete: Some(page_stamp_complete),
    error: None,
};

// ----------------------------------------------------------------------
// The source
// ----------------------------------------------------------------------

/// One started (or advised) read of a block run.
pub enum FileReadOp {
    /// A real read is in flight through the engine.
    Started { ioref: IoRef, ret: Arc<IoReturnCell> },
    /// Advice was issued; the read itself happens at wait time.
    Advised {
        blocknum: BlockNumber,
        frames: Vec<u32>,
    },
}

/// File-backed [`BlockSource`]: fixed frame arena, block map, reads through
/// the engine.
pub struct FileBlockSource<'b> {
    backend: &'b mut Backend,
    file: File,
    fd: RawFd,
    file_id: u32,
    frames: Box<[u8]>,
    map: AHashMap<BlockNumber, u32>,
    /// Block resident in each frame (`NO_BLOCK` when free).
    frame_block: Box<[BlockNumber]>,
    pins: Box<[u32]>,
    free_frames: Vec<u32>,
    verify_checksums: bool,
}

impl<'b> FileBlockSource<'b> {
    pub fn new(backend: &'b mut Backend, file: File, nframes: u32, verify_checksums: bool) -> Self {
        let fd = file.as_raw_fd();
        Self {
            backend,
            file,
            fd,
            file_id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            frames: vec![0u8; nframes as usize * BLOCK_SIZE].into_boxed_slice(),
            map: AHashMap::with_capacity(nframes as usize),
            frame_block: vec![NO_BLOCK; nframes as usize].into_boxed_slice(),
            pins: vec![0u32; nframes as usize].into_boxed_slice(),
            free_frames: (0..nframes).rev().collect(),
            verify_checksums,
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        self.backend
    }

    fn frame_ptr(&mut self, frame: u32) -> *mut u8 {
        &mut self.frames[frame as usize * BLOCK_SIZE] as *mut u8
    }

    /// Bytes of a pinned, read-complete frame.
    pub fn frame_bytes(&self, buffer: Buffer) -> &[u8] {
        let off = buffer.raw() as usize * BLOCK_SIZE;
        &self.frames[off..off + BLOCK_SIZE]
    }

    fn alloc_frame(&mut self) -> u32 {
        if let Some(frame) = self.free_frames.pop() {
            return frame;
        }
        // Evict any unpinned resident frame.
        for frame in 0..self.frame_block.len() as u32 {
            let block = self.frame_block[frame as usize];
            if block != NO_BLOCK && self.pins[frame as usize] == 0 {
                self.map.remove(&block);
                self.frame_block[frame as usize] = NO_BLOCK;
                return frame;
            }
        }
        panic!("all cache frames pinned");
    }

    /// Starts a real engine read of `count` blocks into `frames`.
    fn start_engine_read(&mut self, blocknum: BlockNumber, frames: &[u32]) -> FileReadOp {
        let count = frames.len();
        let ret = Arc::new(IoReturnCell::new());
        let ioh = self.backend.acquire(None, Some(&ret));
        self.backend.set_subject(
            &ioh,
            SubjectId::FILE_BLOCK,
            encode_subject(blocknum, count as u32, self.file_id),
        );
        self.backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
        if self.verify_checksums {
            self.backend.add_callback(&ioh, SharedCallbackId::PAGE_VERIFY);
        }

        let mut io_data = [0u64; crate::config::MAX_IO_COMBINE];
        for i in 0..count {
            io_data[i] = u64::from(blocknum + i as u32);
        }
        let fd = self.fd;
        for (i, &frame) in frames.iter().enumerate() {
            let base = self.frame_ptr(frame);
            // SAFETY: the frame arena outlives the operation and the frame
            // is pinned for this read; nothing else touches it until the
            // wait completes.
            unsafe { self.backend.set_iovec(&ioh, i, base, BLOCK_SIZE) };
        }
        self.backend.set_io_data(&ioh, &io_data[..count]);

        let ioref = self.backend.io_ref(&ioh);
        self.backend
            .stage_readv(ioh, fd, count as u16, u64::from(blocknum) * BLOCK_SIZE as u64);
        // Submit right away so the read genuinely overlaps with whatever
        // the consumer does next.
        self.backend.submit_staged();
        FileReadOp::Started { ioref, ret }
    }

    fn finish(&mut self, ret: &IoReturnCell) {
        let ret = ret.take().expect("result reported at reclaim");
        if ret.result.status != IoResultStatus::Ok {
            // A real buffer manager would zero-fill or retry short reads;
            // this source treats reading past EOF as a caller bug.
            let failure = raise_error(&ret.result, &ret.subject_data);
            panic!("{failure}");
        }
    }

    /// Writes one block through a bounce buffer, stamping its checksum in
    /// the prepare hook, and waits for durability of the transfer.
    pub fn write_block(&mut self, blocknum: BlockNumber, page: &[u8]) {
        assert_eq!(page.len(), BLOCK_SIZE);

        let bb = self.backend.acquire_bounce_buffer(None);
        self.backend.bounce_bytes_mut(&bb).copy_from_slice(page);

        let ret = Arc::new(IoReturnCell::new());
        let ioh = self.backend.acquire(None, Some(&ret));
        self.backend.set_subject(
            &ioh,
            SubjectId::FILE_BLOCK,
            encode_subject(blocknum, 1, self.file_id),
        );
        self.backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
        self.backend.add_callback(&ioh, SharedCallbackId::PAGE_STAMP);
        self.backend.set_io_data(&ioh, &[u64::from(blocknum)]);
        self.backend.set_iovec_bounce(&ioh, 0, &bb);
        self.backend.associate_bounce_buffer(&ioh, bb);

        let ioref = self.backend.io_ref(&ioh);
        let fd = self.fd;
        self.backend
            .stage_writev(ioh, fd, 1, u64::from(blocknum) * BLOCK_SIZE as u64);
        self.backend.submit_staged();
        self.backend.wait_io(ioref);
        self.finish(&ret);

        // Keep a resident copy coherent, checksum stamp included.
        if let Some(&frame) = self.map.get(&blocknum) {
            let off = frame as usize * BLOCK_SIZE;
            self.frames[off..off + BLOCK_SIZE].copy_from_slice(page);
            stamp_page(&mut self.frames[off..off + BLOCK_SIZE]);
        }
    }
}

fn advise_willneed(fd: RawFd, offset: u64, len: u64) {
    #[cfg(target_os = "linux")]
    // SAFETY: plain advisory syscall; failures are ignored by design.
    unsafe {
        libc::posix_fadvise(
            fd,
            offset as libc::off_t,
            len as libc::off_t,
            libc::POSIX_FADV_WILLNEED,
        );
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (fd, offset, len);
}

impl BlockSource for FileBlockSource<'_> {
    type Op = FileReadOp;

    fn start_read_blocks(
        &mut self,
        blocknum: BlockNumber,
        buffers: &mut [Buffer],
        flags: StartReadFlags,
    ) -> StartReadOutcome<FileReadOp> {
        let n = buffers.len();
        debug_assert!(n >= 1);

        // Resident prefix: pin and return without I/O.
        if self.map.contains_key(&blocknum) {
            let mut accepted = 0;
            while accepted < n {
                let Some(&frame) = self.map.get(&(blocknum + accepted as u32)) else {
                    break;
                };
                self.pins[frame as usize] += 1;
                buffers[accepted] = Buffer::new(frame);
                accepted += 1;
            }
            return StartReadOutcome {
                accepted,
                wait: None,
            };
        }

        // Missing prefix: claim frames and start (or advise) one read.
        let mut frames = Vec::with_capacity(n);
        while frames.len() < n && !self.map.contains_key(&(blocknum + frames.len() as u32)) {
            let frame = self.alloc_frame();
            frames.push(frame);
        }
        let count = frames.len();
        for (i, &frame) in frames.iter().enumerate() {
            let block = blocknum + i as u32;
            self.map.insert(block, frame);
            self.frame_block[frame as usize] = block;
            self.pins[frame as usize] = 1;
            buffers[i] = Buffer::new(frame);
        }

        let wait = if flags.issue_advice {
            advise_willneed(
                self.fd,
                u64::from(blocknum) * BLOCK_SIZE as u64,
                count as u64 * BLOCK_SIZE as u64,
            );
            FileReadOp::Advised { blocknum, frames }
        } else {
            self.start_engine_read(blocknum, &frames)
        };

        StartReadOutcome {
            accepted: count,
            wait: Some(wait),
        }
    }

    fn wait_read_blocks(&mut self, op: FileReadOp) {
        match op {
            FileReadOp::Started { ioref, ret } => {
                self.backend.wait_io(ioref);
                self.finish(&ret);
            }
            FileReadOp::Advised { blocknum, frames } => {
                // The advice window is over; do the read for real now.
                let started = self.start_engine_read(blocknum, &frames);
                self.wait_read_blocks(started);
            }
        }
    }

    fn release_buffer(&mut self, buffer: Buffer) {
        let frame = buffer.raw() as usize;
        debug_assert!(self.pins[frame] > 0);
        self.pins[frame] -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trip() {
        let mut page = vec![7u8; BLOCK_SIZE];
        stamp_page(&mut page);
        assert!(verify_page(&page));
        page[100] ^= 0xff;
        assert!(!verify_page(&page));
    }

    #[test]
    fn subject_encoding_round_trips() {
        let data = encode_subject(1234, 16, 9);
        assert_eq!(decode_subject(&data), (1234, 16, 9));
        let rendered = format!(
            "{}",
            crate::registry::SubjectDesc {
                subject: SubjectId::FILE_BLOCK,
                data: &data,
            }
        );
        assert!(rendered.contains("1234"));
        assert!(rendered.contains("file 9"));
    }
}
