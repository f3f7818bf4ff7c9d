//! End-to-end read stream behavior: regime transitions, coalescing,
//! partial accepts, flow control, and the file-backed source.

mod common;

use std::io::Write;

use blockio::{
    BlockNumber, BlockSource, Buffer, EngineConfig, EngineControl, FileBlockSource, IoMethodKind,
    ReadStream, StreamFlags, StreamOptions, BLOCK_SIZE,
};
use common::{script, MockSource};

fn options(max_ios: u32, buffer_io_size: u32, flags: StreamFlags) -> StreamOptions {
    StreamOptions {
        flags,
        max_ios,
        buffer_io_size,
        pin_budget: 1024,
        advice_capable: true,
    }
}

/// Drains a stream of unit-data buffers, asserting engine-side invariants
/// along the way, and returns the buffers in consumption order.
fn drain<F>(mut stream: ReadStream<MockSource, (), F>) -> (Vec<Buffer>, MockSource)
where
    F: FnMut(&mut ()) -> Option<BlockNumber>,
{
    let mut consumed = Vec::new();
    loop {
        let buffer = match stream.next() {
            Some((buffer, _)) => buffer,
            None => break,
        };
        consumed.push(buffer);
        stream.source_mut().release_buffer(buffer);
    }
    let source = stream.end();
    assert_eq!(source.outstanding_pins, 0);
    assert_eq!(source.outstanding_ios, 0);
    (consumed, source)
}

fn blocks(consumed: &[Buffer]) -> Vec<u32> {
    consumed.iter().map(|b| b.raw()).collect()
}

#[test]
fn fully_cached_sequential_stream_issues_no_io() {
    let want: Vec<u32> = (100..200).collect();
    let source = MockSource::new(want.iter().copied());
    let stream = ReadStream::begin(source, &options(4, 16, StreamFlags::NONE), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert!(source.reads.is_empty(), "no physical reads expected");
    assert_eq!(source.waits, 0);
    assert_eq!(source.max_outstanding_ios, 0);
}

#[test]
fn cold_sequential_reads_grow_to_full_transfers() {
    let want: Vec<u32> = (0..128).collect();
    let source = MockSource::new([]);
    let stream = ReadStream::begin(source, &options(2, 16, StreamFlags::NONE), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert_eq!(source.total_blocks_read(), 128, "every block read exactly once");

    // Sequential detection keeps advice off and the reads contiguous.
    let mut expected_next = 0;
    for read in &source.reads {
        assert!(!read.advice, "sequential reads must not issue advice");
        assert_eq!(read.blocknum, expected_next);
        expected_next += read.nblocks as u32;
        assert!(read.nblocks <= 16);
    }
    // Ramp-up reaches the full transfer size and stays there.
    let max_read = source.reads.iter().map(|r| r.nblocks).max().unwrap();
    assert_eq!(max_read, 16);
    assert!(source.max_outstanding_ios <= 2);
}

#[test]
fn cold_random_blocks_get_single_block_advised_reads() {
    let want = vec![5, 4000, 12, 3999];
    let source = MockSource::new([]);
    let stream =
        ReadStream::begin(source, &options(4, 16, StreamFlags::NONE), script(want.clone()))
            .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);

    assert_eq!(source.reads.len(), 4, "no two blocks may coalesce");
    for read in &source.reads {
        assert_eq!(read.nblocks, 1);
    }
    // The very first read of a stream starts too late for advice to help;
    // every later random read is advised.
    assert!(!source.reads[0].advice);
    for read in &source.reads[1..] {
        assert!(read.advice);
    }
}

#[test]
fn random_misses_double_the_lookahead_distance() {
    let want = vec![10, 5000, 20, 6000, 30, 7000];
    let source = MockSource::new([]);
    let mut stream =
        ReadStream::begin(source, &options(8, 16, StreamFlags::NONE), script(want.clone()))
            .unwrap();

    let mut distances = Vec::new();
    loop {
        let buffer = match stream.next() {
            Some((buffer, _)) => buffer,
            None => break,
        };
        distances.push(stream.distance());
        stream.source_mut().release_buffer(buffer);
    }
    stream.end();

    // Ramp: every observed I/O doubles the window (until the pin cap).
    assert!(distances.iter().any(|&d| d >= 4), "distances: {distances:?}");
}

#[test]
fn partial_accept_splits_the_remainder_into_a_new_range() {
    let want: Vec<u32> = (0..5).collect();
    let mut source = MockSource::new([]);
    source.accept_limit = 3;
    let stream = ReadStream::begin(source, &options(2, 16, StreamFlags::FULL), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);

    assert_eq!(source.reads.len(), 2);
    assert_eq!((source.reads[0].blocknum, source.reads[0].nblocks), (0, 3));
    assert_eq!((source.reads[1].blocknum, source.reads[1].nblocks), (3, 2));
}

#[test]
fn full_flag_skips_ramp_up() {
    let want: Vec<u32> = (0..64).collect();
    let source = MockSource::new([]);
    let stream = ReadStream::begin(source, &options(2, 16, StreamFlags::FULL), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert_eq!(
        source.reads[0].nblocks, 16,
        "the first read is already full sized"
    );
}

#[test]
fn zero_max_ios_behaves_as_one_without_advice() {
    let want = vec![5, 4000, 12];
    let source = MockSource::new([]);
    let stream = ReadStream::begin(source, &options(0, 16, StreamFlags::NONE), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert!(source.reads.iter().all(|r| !r.advice));
    assert_eq!(source.max_outstanding_ios, 1);
}

#[test]
fn sequential_flag_suppresses_advice_for_random_blocks() {
    let want = vec![7, 900, 13];
    let source = MockSource::new([]);
    let stream = ReadStream::begin(
        source,
        &options(4, 16, StreamFlags::SEQUENTIAL),
        script(want.clone()),
    )
    .unwrap();

    let (_, source) = drain(stream);
    assert!(source.reads.iter().all(|r| !r.advice));
}

#[test]
fn empty_callback_yields_empty_stream() {
    let source = MockSource::new([]);
    let mut stream =
        ReadStream::begin(source, &options(2, 16, StreamFlags::NONE), script(vec![])).unwrap();
    assert!(stream.next().is_none());
    let source = stream.end();
    assert!(source.reads.is_empty());
}

#[test]
fn flow_control_pushback_preserves_order() {
    // Partial accepts plus a tiny I/O budget force the stream through its
    // unget path; ordering must survive.
    let want = vec![0, 1, 5, 6];
    let mut source = MockSource::new([]);
    source.accept_limit = 1;
    let stream = ReadStream::begin(source, &options(1, 4, StreamFlags::FULL), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert_eq!(source.total_blocks_read(), 4);
    assert_eq!(source.max_outstanding_ios, 1);
}

#[test]
fn per_buffer_data_travels_with_its_block() {
    let want: Vec<u32> = vec![3, 4, 5, 90, 91, 2];
    let mut emit = want.clone().into_iter();
    let source = MockSource::new([4, 90]);
    let mut stream = ReadStream::begin(source, &options(2, 4, StreamFlags::NONE), move |data: &mut u64| {
        let block = emit.next()?;
        *data = u64::from(block) * 10;
        Some(block)
    })
    .unwrap();

    let mut seen = Vec::new();
    loop {
        let (buffer, data) = match stream.next() {
            Some((buffer, data)) => (buffer, *data),
            None => break,
        };
        assert_eq!(data, u64::from(buffer.raw()) * 10);
        seen.push(buffer.raw());
        stream.source_mut().release_buffer(buffer);
    }
    stream.end();
    assert_eq!(seen, want);
}

#[test]
fn mixed_cached_and_cold_runs_switch_regimes() {
    // Cached run, cold run, cached run: the stream must serve all three in
    // order, reading only the cold middle.
    let want: Vec<u32> = (0..48).collect();
    let source = MockSource::new((0..16).chain(32..48));
    let stream = ReadStream::begin(source, &options(2, 8, StreamFlags::NONE), script(want.clone()))
        .unwrap();

    let (consumed, source) = drain(stream);
    assert_eq!(blocks(&consumed), want);
    assert_eq!(source.total_blocks_read(), 16);
    for read in &source.reads {
        assert!((16..32).contains(&read.blocknum));
    }
}

// ----------------------------------------------------------------------
// File-backed source: the stream drives real engine I/O.
// ----------------------------------------------------------------------

fn page_with_payload(block: u32) -> Vec<u8> {
    let mut page = vec![0u8; BLOCK_SIZE];
    for (i, byte) in page.iter_mut().enumerate().skip(4) {
        *byte = (block as usize + i) as u8;
    }
    blockio::stream::file_source::stamp_page(&mut page);
    page
}

fn write_test_file(nblocks: u32) -> std::fs::File {
    let mut file = tempfile::tempfile().unwrap();
    for block in 0..nblocks {
        file.write_all(&page_with_payload(block)).unwrap();
    }
    file.sync_all().unwrap();
    file
}

#[test]
fn file_stream_reads_all_blocks_in_order() {
    let engine = EngineControl::new(EngineConfig {
        io_method: IoMethodKind::Worker,
        ..EngineConfig::default()
    })
    .unwrap();
    let mut backend = engine.register_backend();

    let nblocks = 64;
    let file = write_test_file(nblocks);
    let source = FileBlockSource::new(&mut backend, file, 128, true);

    let config = engine.config().clone();
    let opts = StreamOptions::from_engine(&config, StreamFlags::NONE, 64);
    let want: Vec<u32> = (0..nblocks).collect();
    let mut stream = ReadStream::begin(source, &opts, script(want.clone())).unwrap();

    let mut seen = Vec::new();
    loop {
        let buffer = match stream.next() {
            Some((buffer, _)) => buffer,
            None => break,
        };
        let block = seen.len() as u32;
        let bytes = stream.source_mut().frame_bytes(buffer);
        assert_eq!(bytes[100], ((block as usize) + 100) as u8);
        seen.push(buffer);
        stream.source_mut().release_buffer(buffer);
    }
    stream.end();
    assert_eq!(seen.len(), nblocks as usize);
}

#[test]
fn file_stream_serves_rereads_from_cache() {
    let engine = EngineControl::new(EngineConfig::default()).unwrap();
    let mut backend = engine.register_backend();

    let file = write_test_file(8);
    let source = FileBlockSource::new(&mut backend, file, 32, true);

    let config = engine.config().clone();
    let opts = StreamOptions::from_engine(&config, StreamFlags::NONE, 16);
    // Every block twice: the second pass must come from the frame cache.
    let want: Vec<u32> = (0..8).chain(0..8).collect();
    let mut stream = ReadStream::begin(source, &opts, script(want.clone())).unwrap();

    let mut count = 0;
    loop {
        let buffer = match stream.next() {
            Some((buffer, _)) => buffer,
            None => break,
        };
        count += 1;
        stream.source_mut().release_buffer(buffer);
    }
    stream.end();
    assert_eq!(count, 16);
}

#[test]
fn write_block_round_trips_through_bounce_buffers() {
    let engine = EngineControl::new(EngineConfig::default()).unwrap();
    let mut backend = engine.register_backend();

    let file = write_test_file(4);
    let mut source = FileBlockSource::new(&mut backend, file, 8, true);

    let mut page = vec![0u8; BLOCK_SIZE];
    page[4..].fill(0xa5);
    source.write_block(2, &page);

    // Read it back through the stream; checksum verification runs in the
    // completion chain and the payload must match what was written.
    let config = engine.config().clone();
    let opts = StreamOptions::from_engine(&config, StreamFlags::NONE, 8);
    let mut stream = ReadStream::begin(source, &opts, script(vec![2])).unwrap();
    let (buffer, _) = stream.next().expect("one block");
    assert!(stream.source_mut().frame_bytes(buffer)[4..].iter().all(|&b| b == 0xa5));
    stream.source_mut().release_buffer(buffer);
    stream.end();
}
