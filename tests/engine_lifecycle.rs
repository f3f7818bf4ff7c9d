//! Handle lifecycle, references, methods, bounce buffers, and scope
//! unwinding against real files.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use blockio::{
    Backend, EngineConfig, EngineControl, IoMethodKind, IoResultStatus, IoReturnCell,
    ResourceOwner, SharedCallbackId, SubjectId, BLOCK_SIZE,
};

fn engine(io_method: IoMethodKind) -> Arc<EngineControl> {
    EngineControl::new(EngineConfig {
        io_method,
        io_max_concurrency: 4,
        io_bounce_buffers: 4,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn subject_data(blocknum: u32, nblocks: u32) -> blockio::SubjectData {
    blockio::SubjectData {
        words: [u64::from(blocknum) | (u64::from(nblocks) << 32), 7],
    }
}

fn write_blocks(nblocks: usize, fill: u8) -> std::fs::File {
    let mut file = tempfile::tempfile().unwrap();
    let mut page = vec![fill; BLOCK_SIZE];
    for _ in 0..nblocks {
        blockio::stream::file_source::stamp_page(&mut page);
        file.write_all(&page).unwrap();
    }
    file.sync_all().unwrap();
    file
}

/// Reads `nblocks` from `fd` at block `blocknum` into `target`, returning
/// the reported result.
fn read_blocks(
    backend: &mut Backend,
    fd: i32,
    blocknum: u32,
    target: &mut [u8],
    verify: bool,
) -> blockio::IoReturn {
    let nblocks = target.len() / BLOCK_SIZE;
    let ret = Arc::new(IoReturnCell::new());
    let ioh = backend.acquire(None, Some(&ret));
    backend.set_subject(&ioh, SubjectId::FILE_BLOCK, subject_data(blocknum, nblocks as u32));
    backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
    if verify {
        backend.add_callback(&ioh, SharedCallbackId::PAGE_VERIFY);
    }
    let io_data: Vec<u64> = (0..nblocks as u64).map(|i| u64::from(blocknum) + i).collect();
    backend.set_io_data(&ioh, &io_data);
    for i in 0..nblocks {
        // SAFETY: `target` outlives the wait below.
        unsafe {
            backend.set_iovec(&ioh, i, target[i * BLOCK_SIZE..].as_mut_ptr(), BLOCK_SIZE);
        }
    }
    let ioref = backend.io_ref(&ioh);
    backend.stage_readv(ioh, fd, nblocks as u16, u64::from(blocknum) * BLOCK_SIZE as u64);
    backend.submit_staged();
    backend.wait_io(ioref);
    ret.take().expect("result reported at reclaim")
}

#[test]
fn acquire_release_bumps_generation_and_reuses_the_slot() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let ioh = backend.acquire(None, None);
    let first = backend.io_ref(&ioh);
    backend.release(ioh);

    let ioh = backend.acquire(None, None);
    let second = backend.io_ref(&ioh);
    backend.release(ioh);

    assert_eq!(first.index(), second.index(), "free list reuses the slot");
    assert!(backend.check_done(first));
    assert!(backend.check_done(second));
}

#[test]
fn submit_staged_without_work_is_a_no_op() {
    let engine = engine(IoMethodKind::Worker);
    let mut backend = engine.register_backend();
    assert!(!backend.have_staged());
    backend.submit_staged();
    backend.submit_staged();
    assert!(!backend.have_staged());
}

#[test]
fn nop_completes_with_zero_result() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let ret = Arc::new(IoReturnCell::new());
    let ioh = backend.acquire(None, Some(&ret));
    backend.set_subject(&ioh, SubjectId::FILE_BLOCK, subject_data(0, 0));
    let ioref = backend.io_ref(&ioh);
    backend.stage_nop(ioh);

    // Sync method executes inline; nothing left to wait for.
    assert!(backend.check_done(ioref));
    let ret = ret.take().unwrap();
    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert_eq!(ret.result.result, 0);
}

#[test]
fn sync_method_reads_through_caller_memory() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let file = write_blocks(4, 0x3c);
    let mut target = vec![0u8; 2 * BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 1, &mut target, true);

    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert_eq!(ret.result.result as usize, 2 * BLOCK_SIZE);
    assert!(target[4..BLOCK_SIZE].iter().all(|&b| b == 0x3c));
}

#[test]
fn worker_method_completes_cross_thread() {
    let engine = engine(IoMethodKind::Worker);
    let mut backend = engine.register_backend();

    let file = write_blocks(4, 0x5a);
    let mut target = vec![0u8; BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 2, &mut target, true);

    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert!(target[4..].iter().all(|&b| b == 0x5a));
}

#[test]
fn posix_method_reads_single_segment_async() {
    let engine = engine(IoMethodKind::PosixAio);
    let mut backend = engine.register_backend();

    let file = write_blocks(2, 0x11);
    let mut target = vec![0u8; BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 0, &mut target, true);
    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert!(target[4..].iter().all(|&b| b == 0x11));
}

#[test]
fn posix_method_falls_back_to_inline_for_vectored_reads() {
    let engine = engine(IoMethodKind::PosixAio);
    let mut backend = engine.register_backend();

    let file = write_blocks(3, 0x22);
    let mut target = vec![0u8; 2 * BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 0, &mut target, true);
    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert_eq!(ret.result.result as usize, 2 * BLOCK_SIZE);
}

#[cfg(target_os = "linux")]
#[test]
fn uring_method_reads_vectored() {
    let engine = engine(IoMethodKind::IoUring);
    let mut backend = engine.register_backend();

    let file = write_blocks(4, 0x77);
    let mut target = vec![0u8; 3 * BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 1, &mut target, true);
    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert_eq!(ret.result.result as usize, 3 * BLOCK_SIZE);
    assert!(target[4..BLOCK_SIZE].iter().all(|&b| b == 0x77));
}

#[test]
fn bad_descriptor_distills_to_an_io_error() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let mut target = vec![0u8; BLOCK_SIZE];
    let ret = read_blocks(&mut backend, -1, 9, &mut target, true);

    assert_eq!(ret.result.status, IoResultStatus::IoError);
    assert_eq!(ret.result.id, SharedCallbackId::FILE_BLOCK);
    assert_eq!(ret.result.error_data as i32, libc::EBADF);

    let failure = blockio::raise_error(&ret.result, &ret.subject_data);
    let message = format!("{failure}");
    assert!(message.contains("could not transfer blocks 9..10"), "{message}");
}

#[test]
fn corrupt_page_distills_to_a_validation_error() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![0xffu8; BLOCK_SIZE]).unwrap();
    file.sync_all().unwrap();

    let mut target = vec![0u8; BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 0, &mut target, true);

    assert_eq!(ret.result.status, IoResultStatus::Invalid);
    assert_eq!(ret.result.id, SharedCallbackId::PAGE_VERIFY);
    assert_eq!(ret.result.error_data, 0, "failing block number");

    let message = format!("{}", blockio::raise_error(&ret.result, &ret.subject_data));
    assert!(message.contains("invalid page in block 0"), "{message}");
}

#[test]
fn short_read_is_reported_truthfully() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    // One block on disk, two requested.
    let file = write_blocks(1, 0x44);
    let mut target = vec![0u8; 2 * BLOCK_SIZE];
    let ret = read_blocks(&mut backend, file.as_raw_fd(), 0, &mut target, false);

    assert_eq!(ret.result.status, IoResultStatus::Short);
    assert_eq!(ret.result.error_data, 1, "whole blocks transferred");
    assert_eq!(ret.result.result as usize, BLOCK_SIZE);
}

#[test]
fn handle_exhaustion_blocks_and_recovers() {
    let engine = engine(IoMethodKind::Worker);
    let mut backend = engine.register_backend();

    let file = write_blocks(8, 0x66);
    let fd = file.as_raw_fd();
    // More sequential single-block reads than handle slots; acquire must
    // recycle completed slots under the hood.
    let mut targets: Vec<Vec<u8>> = (0..8).map(|_| vec![0u8; BLOCK_SIZE]).collect();
    let mut refs = Vec::new();
    for (i, target) in targets.iter_mut().enumerate() {
        let ioh = backend.acquire(None, None);
        backend.set_subject(&ioh, SubjectId::FILE_BLOCK, subject_data(i as u32, 1));
        backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
        // SAFETY: targets outlive the waits below.
        unsafe { backend.set_iovec(&ioh, 0, target.as_mut_ptr(), BLOCK_SIZE) };
        refs.push(backend.io_ref(&ioh));
        backend.stage_readv(ioh, fd, 1, i as u64 * BLOCK_SIZE as u64);
    }
    backend.submit_staged();
    for ioref in refs {
        backend.wait_io(ioref);
        assert!(backend.check_done(ioref));
    }
    for target in &targets {
        assert!(target[4..].iter().all(|&b| b == 0x66));
    }
}

#[test]
#[should_panic(expected = "only one I/O can be handed out")]
fn double_acquire_is_an_api_violation() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();
    let _first = backend.acquire(None, None);
    let _second = backend.acquire(None, None);
}

#[test]
#[should_panic(expected = "without a subject")]
fn staging_without_a_subject_is_an_api_violation() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();
    let ioh = backend.acquire(None, None);
    backend.stage_nop(ioh);
}

// ----------------------------------------------------------------------
// Bounce buffers
// ----------------------------------------------------------------------

#[test]
fn bounce_buffers_cycle_through_handles() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let file = write_blocks(1, 0);
    let fd = file.as_raw_fd();

    // Write a checksummed page out of a bounce buffer; the buffer returns
    // to the pool at reclaim, so this loop outlasts the pool size.
    for round in 0..8u8 {
        let bb = backend.acquire_bounce_buffer(None);
        backend.bounce_bytes_mut(&bb)[4..].fill(round);

        let ret = Arc::new(IoReturnCell::new());
        let ioh = backend.acquire(None, Some(&ret));
        backend.set_subject(&ioh, SubjectId::FILE_BLOCK, subject_data(0, 1));
        backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
        backend.add_callback(&ioh, SharedCallbackId::PAGE_STAMP);
        backend.set_iovec_bounce(&ioh, 0, &bb);
        backend.associate_bounce_buffer(&ioh, bb);
        let ioref = backend.io_ref(&ioh);
        backend.stage_writev(ioh, fd, 1, 0);
        backend.submit_staged();
        backend.wait_io(ioref);
        assert_eq!(ret.take().unwrap().result.status, IoResultStatus::Ok);
    }

    // The stamp hook ran against the bounce copy: the page on disk
    // verifies.
    let mut target = vec![0u8; BLOCK_SIZE];
    let ret = read_blocks(&mut backend, fd, 0, &mut target, true);
    assert_eq!(ret.result.status, IoResultStatus::Ok);
    assert!(target[4..].iter().all(|&b| b == 7));
}

#[test]
fn unassociated_bounce_buffer_returns_to_the_pool() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();
    for _ in 0..8 {
        let bb = backend.acquire_bounce_buffer(None);
        backend.release_bounce_buffer(bb);
    }
    backend.at_scope_end();
}

// ----------------------------------------------------------------------
// Resource owners
// ----------------------------------------------------------------------

#[test]
fn scope_unwind_force_submits_staged_handles() {
    let engine = engine(IoMethodKind::Worker);
    let mut backend = engine.register_backend();

    let file = write_blocks(2, 0x88);
    let owner = ResourceOwner::new("test scope");
    let ret = Arc::new(IoReturnCell::new());
    let mut target = vec![0u8; BLOCK_SIZE];

    let ioh = backend.acquire(Some(&owner), Some(&ret));
    backend.set_subject(&ioh, SubjectId::FILE_BLOCK, subject_data(0, 1));
    backend.add_callback(&ioh, SharedCallbackId::FILE_BLOCK);
    // SAFETY: target outlives the forced submission and wait below.
    unsafe { backend.set_iovec(&ioh, 0, target.as_mut_ptr(), BLOCK_SIZE) };
    let ioref = backend.io_ref(&ioh);
    backend.stage_readv(ioh, file.as_raw_fd(), 1, 0);
    assert!(backend.have_staged());

    // The transactional scope aborts with the handle staged: it must be
    // submitted and left to complete, and the result sink dropped.
    owner.release_all(&mut backend, true);
    assert!(!backend.have_staged());

    backend.wait_io(ioref);
    assert!(backend.check_done(ioref));
    assert!(ret.take().is_none(), "unwound scopes report nothing");
    backend.at_scope_end();
}

#[test]
fn scope_unwind_reclaims_a_handed_out_handle() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let owner = ResourceOwner::new("leaky scope");
    let ioh = backend.acquire(Some(&owner), None);
    let ioref = backend.io_ref(&ioh);
    std::mem::forget(ioh);

    owner.release_all(&mut backend, false);
    assert!(backend.check_done(ioref), "the slot was recycled");

    // The backend is fully usable again.
    let ioh = backend.acquire(None, None);
    backend.release(ioh);
    backend.at_scope_end();
}

#[test]
fn scope_unwind_releases_a_handed_out_bounce_buffer() {
    let engine = engine(IoMethodKind::Sync);
    let mut backend = engine.register_backend();

    let owner = ResourceOwner::new("bounce scope");
    let bb = backend.acquire_bounce_buffer(Some(&owner));
    std::mem::forget(bb);

    owner.release_all(&mut backend, true);
    backend.at_scope_end();

    // All buffers are back: acquiring pool-size buffers works.
    for _ in 0..4 {
        let bb = backend.acquire_bounce_buffer(None);
        backend.release_bounce_buffer(bb);
    }
}
