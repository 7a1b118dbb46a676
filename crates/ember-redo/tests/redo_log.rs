//! End-to-end tests for the redo log core: the mini-transaction append
//! path, durability, checkpoint alternation, back-pressure, and buffer
//! extension.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use ember_common::constants::{
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE, LOG_FILE_HDR_SIZE, LOG_START_LSN,
    PAGE_SIZE,
};
use ember_common::Lsn;
use ember_redo::{
    block, BufferPool, ChecksumAlgorithm, CheckpointSlot, CleanBufferPool, NoDataFiles,
    RedoConfig, RedoLog, ShutdownMode,
};

fn test_config(dir: &std::path::Path) -> RedoConfig {
    RedoConfig::new(dir)
        .with_n_files(2)
        .with_file_size(1024 * 1024 + LOG_FILE_HDR_SIZE)
        .with_buffer_size(128 * 1024)
        .with_thread_concurrency(4)
}

fn open_log(config: RedoConfig) -> RedoLog {
    RedoLog::create(config, Arc::new(CleanBufferPool), Arc::new(NoDataFiles)).unwrap()
}

fn append(log: &RedoLog, bytes: &[u8]) -> (Lsn, Lsn) {
    let mut mtr = log.reserve_and_open(bytes.len()).unwrap();
    let start = mtr.start_lsn();
    mtr.write(bytes);
    (start, mtr.close())
}

/// Reads back the block-aligned range containing `[start, end)` and
/// returns the concatenated payload bytes (headers and trailers stripped),
/// starting at `start`.
fn read_payload(log: &RedoLog, algorithm: ChecksumAlgorithm, start: Lsn, end: Lsn) -> Vec<u8> {
    let area_start = start.as_u64() & !(LOG_BLOCK_SIZE as u64 - 1);
    let area_end = (end.as_u64() + LOG_BLOCK_SIZE as u64 - 1) & !(LOG_BLOCK_SIZE as u64 - 1);

    let mut raw = vec![0u8; (area_end - area_start) as usize];
    log.read_log_seg(&mut raw, 0, Lsn::new(area_start), Lsn::new(area_end))
        .unwrap();

    let mut payload = Vec::new();
    for (i, chunk) in raw.chunks(LOG_BLOCK_SIZE).enumerate() {
        block::verify_checksum(chunk, algorithm).unwrap();

        let block_lsn = area_start + (i * LOG_BLOCK_SIZE) as u64;
        let data_end = block::data_len(chunk).min(LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE);
        for offset in LOG_BLOCK_HDR_SIZE..data_end {
            let lsn = block_lsn + offset as u64;
            if lsn >= start.as_u64() && lsn < end.as_u64() {
                payload.push(chunk[offset]);
            }
        }
    }
    payload
}

// A record that fits in the current block.
#[test]
fn append_within_block() {
    let tmp = TempDir::new().unwrap();
    let log = open_log(test_config(tmp.path()));

    let lsn_before = log.lsn();
    let (start, end) = append(&log, &[0x41u8; 100]);

    assert_eq!(start, lsn_before);
    assert_eq!(end.diff(start), 100);

    log.buffer_flush_to_disk().unwrap();

    let mut first_block = vec![0u8; LOG_BLOCK_SIZE];
    log.read_log_seg(
        &mut first_block,
        0,
        Lsn::new(LOG_START_LSN),
        Lsn::new(LOG_START_LSN + LOG_BLOCK_SIZE as u64),
    )
    .unwrap();

    assert_eq!(block::data_len(&first_block), LOG_BLOCK_HDR_SIZE + 100);
    assert_eq!(block::first_rec_group(&first_block), LOG_BLOCK_HDR_SIZE);
}

// A record straddling a block boundary.
#[test]
fn append_crossing_block() {
    let tmp = TempDir::new().unwrap();
    let log = open_log(test_config(tmp.path()));

    // Fill the first block up to 20 payload bytes short of full.
    let fill = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE - LOG_BLOCK_HDR_SIZE - 20;
    append(&log, &vec![0x00u8; fill]);

    let (start, end) = append(&log, &[0xCDu8; 100]);

    // 20 bytes complete the first block; crossing costs one header plus
    // one trailer of LSN space; 80 bytes land in the next block.
    assert_eq!(
        end.diff(start),
        100 + (LOG_BLOCK_HDR_SIZE + LOG_BLOCK_TRL_SIZE) as u64
    );

    log.buffer_flush_to_disk().unwrap();

    let mut blocks = vec![0u8; 2 * LOG_BLOCK_SIZE];
    log.read_log_seg(
        &mut blocks,
        0,
        Lsn::new(LOG_START_LSN),
        Lsn::new(LOG_START_LSN + 2 * LOG_BLOCK_SIZE as u64),
    )
    .unwrap();

    let first = &blocks[..LOG_BLOCK_SIZE];
    let second = &blocks[LOG_BLOCK_SIZE..];

    // The first block was finalized full; the record group that began the
    // second block starts 80 payload bytes in.
    assert_eq!(block::data_len(first), LOG_BLOCK_SIZE);
    assert_eq!(block::data_len(second), LOG_BLOCK_HDR_SIZE + 80);
    assert_eq!(
        block::first_rec_group(second),
        LOG_BLOCK_HDR_SIZE + 80
    );
}

// Flush and durability: the on-disk bytes match what was
// appended, with valid checksums.
#[test]
fn flush_and_durability() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let algorithm = config.checksum_algorithm;
    let log = open_log(config);

    let payload = vec![0xB7u8; 2048];
    let (start, end) = append(&log, &payload);

    log.write_up_to(end, true).unwrap();

    assert!(log.write_lsn() >= end);
    assert!(log.flushed_to_disk_lsn() >= end);

    let on_disk = read_payload(&log, algorithm, start, end);
    assert_eq!(on_disk, payload);
}

// Five checkpoints alternate slots; recovery picks the valid
// slot with the higher number.
#[test]
fn checkpoint_alternation() {
    let tmp = TempDir::new().unwrap();
    let log = open_log(test_config(tmp.path()));

    let mut expected = Vec::new();
    for round in 0u8..5 {
        append(&log, &vec![round; 300]);
        expected.push(CheckpointSlot::for_checkpoint_no(log.next_checkpoint_no()));
        assert!(log.checkpoint(true, false).unwrap());
    }

    assert_eq!(
        expected,
        vec![
            CheckpointSlot::First,
            CheckpointSlot::Second,
            CheckpointSlot::First,
            CheckpointSlot::Second,
            CheckpointSlot::First,
        ]
    );

    // Both slots are valid; the latest checkpoint is the higher-numbered
    // one and records the last target.
    let first = log.read_checkpoint_info(0, CheckpointSlot::First).unwrap();
    let second = log.read_checkpoint_info(0, CheckpointSlot::Second).unwrap();
    let latest = log.latest_checkpoint(0).unwrap();

    assert_eq!(
        latest.checkpoint_no,
        first.checkpoint_no.max(second.checkpoint_no)
    );
    assert_eq!(latest.checkpoint_lsn, log.last_checkpoint_lsn());
}

/// Pool that tracks a genuine oldest-dirty LSN: pages become dirty as the
/// test appends, and only flushing advances the watermark.
struct LaggingPool {
    oldest: AtomicU64,
}

impl BufferPool for LaggingPool {
    fn oldest_modification(&self) -> Option<Lsn> {
        Some(Lsn::new(self.oldest.load(Ordering::Acquire)))
    }

    fn flush_to_lsn(&self, target: Lsn) -> (bool, usize) {
        let before = self.oldest.fetch_max(target.as_u64(), Ordering::AcqRel);
        (true, usize::from(target.as_u64() > before))
    }

    fn flush_in_progress(&self) -> bool {
        false
    }

    fn all_clean(&self) -> bool {
        false
    }
}

// Back-pressure: generating far more log than the checkpoint age allows
// forces synchronous checkpoints inside the reservation path, and the
// freshness bound holds afterwards.
#[test]
fn back_pressure_forces_checkpoint() {
    let tmp = TempDir::new().unwrap();
    // Geometry chosen so max_checkpoint_age is about 1 MiB.
    let config = RedoConfig::new(tmp.path())
        .with_n_files(2)
        .with_file_size(768 * 1024 + LOG_FILE_HDR_SIZE)
        .with_buffer_size(128 * 1024)
        .with_thread_concurrency(4);
    let pool = Arc::new(LaggingPool {
        oldest: AtomicU64::new(LOG_START_LSN),
    });
    let log = RedoLog::create(
        config,
        Arc::clone(&pool) as Arc<dyn BufferPool>,
        Arc::new(NoDataFiles),
    )
    .unwrap();

    let max_age = log.max_checkpoint_age();
    assert!((900_000..1_200_000).contains(&max_age));

    // 1.5 MiB of log, half again over the allowed age.
    let chunk = 16 * 1024;
    for _ in 0..96 {
        append(&log, &vec![0x99u8; chunk]);
    }

    assert!(log.last_checkpoint_lsn() > Lsn::new(LOG_START_LSN));
    assert!(log.lsn().diff(log.last_checkpoint_lsn()) <= max_age);
}

// A reservation larger than half the buffer grows it, with all
// prior bytes preserved.
#[test]
fn buffer_extension() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path()).with_buffer_size(64 * 1024);
    let algorithm = config.checksum_algorithm;
    let log = open_log(config);

    assert_eq!(log.buffer_size(), 64 * 1024);

    // Some earlier records that must survive the reallocation.
    let (prior_start, prior_end) = append(&log, &[0x77u8; 600]);

    let big = vec![0xEAu8; 40 * 1024];
    let (start, end) = append(&log, &big);

    let request = 40 * 1024usize;
    assert!(log.buffer_size() >= (request / PAGE_SIZE + 1) * PAGE_SIZE);

    log.buffer_flush_to_disk().unwrap();

    assert_eq!(
        read_payload(&log, algorithm, prior_start, prior_end),
        vec![0x77u8; 600]
    );
    assert_eq!(read_payload(&log, algorithm, start, end), big);
}

// The write law: repeating a non-flushing write of the same target is
// idempotent.
#[test]
fn write_up_to_idempotent() {
    let tmp = TempDir::new().unwrap();
    let log = open_log(test_config(tmp.path()));

    let (_, end) = append(&log, &[0x88u8; 700]);

    log.write_up_to(end, false).unwrap();
    let write_lsn = log.write_lsn();
    let ios = log.stats.n_log_ios.load(Ordering::Relaxed);

    log.write_up_to(end, false).unwrap();
    assert_eq!(log.write_lsn(), write_lsn);
    assert_eq!(log.stats.n_log_ios.load(Ordering::Relaxed), ios);
}

// The flush law: after buffer_flush_to_disk, a peeked LSN is durable.
#[test]
fn flush_law() {
    let tmp = TempDir::new().unwrap();
    let log = open_log(test_config(tmp.path()));

    append(&log, &[0x99u8; 321]);
    log.buffer_flush_to_disk().unwrap();

    let peeked = log.peek_lsn().unwrap();
    assert!(log.flushed_to_disk_lsn() >= peeked);
}

// Concurrent appenders and flushers: LSN ranges stay disjoint and ordered,
// and the watermark invariant holds throughout.
#[test]
fn concurrent_appenders_keep_invariants() {
    let tmp = TempDir::new().unwrap();
    let log = Arc::new(open_log(test_config(tmp.path())));

    let mut handles = Vec::new();
    for thread_no in 0..4u8 {
        let log = Arc::clone(&log);
        handles.push(std::thread::spawn(move || {
            let mut ranges = Vec::new();
            for i in 0..40 {
                let payload = vec![thread_no; 128 + (i % 7) * 100];
                let (start, end) = {
                    let mut mtr = log.reserve_and_open(payload.len()).unwrap();
                    let start = mtr.start_lsn();
                    mtr.write(&payload);
                    (start, mtr.close())
                };
                if i % 5 == 0 {
                    log.write_up_to(end, true).unwrap();
                    assert!(log.flushed_to_disk_lsn() >= end);
                }
                assert!(log.flushed_to_disk_lsn() <= log.write_lsn());
                ranges.push((start, end));
            }
            ranges
        }));
    }

    let mut all: Vec<(Lsn, Lsn)> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    all.sort();

    for pair in all.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }

    assert!(log.write_lsn() <= log.lsn());
}

// A clean shutdown leaves the log fully checkpointed and durable; the log
// survives a reopen of the same files.
#[test]
fn shutdown_then_inspect_files() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let final_lsn = {
        let log = open_log(config.clone());
        append(&log, &[0xA1u8; 10_000]);
        log.shutdown(ShutdownMode::Normal).unwrap()
    };

    // A fresh handle over the same files still finds the checkpoint that
    // shutdown wrote.
    let log = open_log(config);
    let latest = log.latest_checkpoint(0).unwrap();
    assert_eq!(latest.checkpoint_lsn, final_lsn);
}
