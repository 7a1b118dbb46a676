//! Checkpoint coordinator.
//!
//! A checkpoint asserts that every change below its LSN is safely in the
//! data files, letting recovery start there instead of at the beginning of
//! the log. Checkpoint info is written to one of two fixed slots in each
//! group's first file, alternating by checkpoint number parity: if a crash
//! tears one slot, the other still holds the prior valid checkpoint, and
//! recovery picks whichever valid slot has the higher number.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;

use ember_common::constants::{
    LOG_BLOCK_SIZE, LOG_CHECKPOINT_1, LOG_CHECKPOINT_2, LOG_CHECKPOINT_ARCHIVED_LSN,
    LOG_CHECKPOINT_CHECKSUM_1, LOG_CHECKPOINT_CHECKSUM_2, LOG_CHECKPOINT_LOG_BUF_SIZE,
    LOG_CHECKPOINT_LSN, LOG_CHECKPOINT_NO, LOG_CHECKPOINT_OFFSET_HIGH32,
    LOG_CHECKPOINT_OFFSET_LOW32, LOG_CHECKPOINT_SIZE, MLOG_CHECKPOINT,
    SIZE_OF_MLOG_CHECKPOINT,
};
use ember_common::Lsn;

use crate::checksum::pair_fold_u32;
use crate::error::{RedoError, RedoResult};
use crate::files::IoToken;
use crate::log::{LogInner, RedoLog, SHUTDOWN_NONE};

/// One of the two checkpoint slots in a log file's header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// The first slot, used by even-numbered checkpoints.
    First,
    /// The second slot, used by odd-numbered checkpoints.
    Second,
}

impl CheckpointSlot {
    /// File offset of this slot.
    #[must_use]
    pub fn offset(self) -> u64 {
        match self {
            Self::First => LOG_CHECKPOINT_1,
            Self::Second => LOG_CHECKPOINT_2,
        }
    }

    /// The slot used by the checkpoint with the given number.
    #[must_use]
    pub fn for_checkpoint_no(no: u64) -> Self {
        if no & 1 == 1 {
            Self::Second
        } else {
            Self::First
        }
    }
}

/// Decoded contents of a valid checkpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Checkpoint counter.
    pub checkpoint_no: u64,
    /// All changes below this LSN are in the data files.
    pub checkpoint_lsn: Lsn,
    /// Byte position of `checkpoint_lsn` within the group.
    pub lsn_offset: u64,
    /// Log buffer size at the time of the checkpoint.
    pub log_buf_size: u32,
}

/// Builds the 512-byte checkpoint block.
fn build_checkpoint_block(
    checkpoint_no: u64,
    checkpoint_lsn: Lsn,
    lsn_offset: u64,
    log_buf_size: usize,
) -> [u8; LOG_BLOCK_SIZE] {
    let mut buf = [0u8; LOG_BLOCK_SIZE];

    buf[LOG_CHECKPOINT_NO..LOG_CHECKPOINT_NO + 8].copy_from_slice(&checkpoint_no.to_be_bytes());
    buf[LOG_CHECKPOINT_LSN..LOG_CHECKPOINT_LSN + 8]
        .copy_from_slice(&checkpoint_lsn.to_be_bytes());
    buf[LOG_CHECKPOINT_OFFSET_LOW32..LOG_CHECKPOINT_OFFSET_LOW32 + 4]
        .copy_from_slice(&((lsn_offset & 0xFFFF_FFFF) as u32).to_be_bytes());
    buf[LOG_CHECKPOINT_OFFSET_HIGH32..LOG_CHECKPOINT_OFFSET_HIGH32 + 4]
        .copy_from_slice(&((lsn_offset >> 32) as u32).to_be_bytes());
    buf[LOG_CHECKPOINT_LOG_BUF_SIZE..LOG_CHECKPOINT_LOG_BUF_SIZE + 4]
        .copy_from_slice(&(log_buf_size as u32).to_be_bytes());

    // Archiving is off: the archived LSN slot carries the maximum value and
    // the per-group info array stays zeroed.
    buf[LOG_CHECKPOINT_ARCHIVED_LSN..LOG_CHECKPOINT_ARCHIVED_LSN + 8]
        .copy_from_slice(&Lsn::MAX.to_be_bytes());

    let checksum1 = pair_fold_u32(&buf[..LOG_CHECKPOINT_CHECKSUM_1]);
    buf[LOG_CHECKPOINT_CHECKSUM_1..LOG_CHECKPOINT_CHECKSUM_1 + 4]
        .copy_from_slice(&checksum1.to_be_bytes());

    let checksum2 = pair_fold_u32(&buf[LOG_CHECKPOINT_LSN..LOG_CHECKPOINT_CHECKSUM_2]);
    buf[LOG_CHECKPOINT_CHECKSUM_2..LOG_CHECKPOINT_CHECKSUM_2 + 4]
        .copy_from_slice(&checksum2.to_be_bytes());

    buf
}

fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Validates both checksums of a checkpoint block and decodes it.
pub fn decode_checkpoint_block(buf: &[u8], slot_offset: u64) -> RedoResult<CheckpointInfo> {
    if buf.len() < LOG_CHECKPOINT_SIZE {
        return Err(RedoError::checkpoint_slot_invalid(slot_offset, "short block"));
    }

    let stored1 = read_u32_at(buf, LOG_CHECKPOINT_CHECKSUM_1);
    if stored1 != pair_fold_u32(&buf[..LOG_CHECKPOINT_CHECKSUM_1]) {
        return Err(RedoError::checkpoint_slot_invalid(
            slot_offset,
            "first checksum mismatch",
        ));
    }

    let stored2 = read_u32_at(buf, LOG_CHECKPOINT_CHECKSUM_2);
    if stored2 != pair_fold_u32(&buf[LOG_CHECKPOINT_LSN..LOG_CHECKPOINT_CHECKSUM_2]) {
        return Err(RedoError::checkpoint_slot_invalid(
            slot_offset,
            "second checksum mismatch",
        ));
    }

    let low = read_u32_at(buf, LOG_CHECKPOINT_OFFSET_LOW32);
    let high = read_u32_at(buf, LOG_CHECKPOINT_OFFSET_HIGH32);

    Ok(CheckpointInfo {
        checkpoint_no: read_u64_at(buf, LOG_CHECKPOINT_NO),
        checkpoint_lsn: Lsn::new(read_u64_at(buf, LOG_CHECKPOINT_LSN)),
        lsn_offset: (u64::from(high) << 32) | u64::from(low),
        log_buf_size: read_u32_at(buf, LOG_CHECKPOINT_LOG_BUF_SIZE),
    })
}

/// Encodes the checkpoint marker record for the given LSN.
fn checkpoint_marker(lsn: Lsn) -> [u8; SIZE_OF_MLOG_CHECKPOINT] {
    let mut marker = [0u8; SIZE_OF_MLOG_CHECKPOINT];
    marker[0] = MLOG_CHECKPOINT;
    marker[1..].copy_from_slice(&lsn.to_be_bytes());
    marker
}

impl RedoLog {
    /// Makes a checkpoint at the oldest modification in the buffer pool.
    ///
    /// Does not flush dirty pages itself; it records what is already safe.
    /// Use [`make_checkpoint_at`](Self::make_checkpoint_at) to flush the
    /// pool as well.
    ///
    /// Returns `Ok(false)` when another checkpoint write was already
    /// running (after waiting for it when `sync` is set); `write_always`
    /// forces a write even if nothing was logged since the last checkpoint.
    pub fn checkpoint(&self, sync: bool, write_always: bool) -> RedoResult<bool> {
        // Any data page written before this checkpoint must be durable
        // before the checkpoint claims changes below its LSN are safe.
        if self.config.flush_method.data_fsync_required() {
            self.data_files.flush()?;
        }

        let mut inner = self.inner.lock();

        let oldest = self
            .pool
            .oldest_modification()
            .unwrap_or(inner.lsn)
            .min(inner.lsn);

        if !write_always
            && oldest == inner.last_checkpoint_lsn.offset(SIZE_OF_MLOG_CHECKPOINT as u64)
        {
            // Nothing was logged since the previous checkpoint other than
            // its own marker.
            return Ok(true);
        }

        // Append the registered checkpoint records and the checkpoint
        // marker while the mutex blocks producers, so no page with a lower
        // modification LSN can enter the flush list after we read `oldest`.
        let mut flush_lsn = oldest;
        let at_shutdown = self.shutdown_state.load(Ordering::Acquire) != SHUTDOWN_NONE;
        let write_marker = !at_shutdown || flush_lsn != inner.lsn;

        let mut appended = false;
        if let Some(extra) = inner.append_on_checkpoint.clone() {
            self.append_record_locked(&mut inner, &extra);
            appended = true;
        }
        if write_marker {
            let marker = checkpoint_marker(flush_lsn);
            self.append_record_locked(&mut inner, &marker);
            appended = true;
        }
        if appended {
            flush_lsn = inner.lsn;
        }

        drop(inner);

        self.write_up_to(flush_lsn, true)?;

        let mut inner = self.inner.lock();

        if !write_always && inner.last_checkpoint_lsn >= oldest {
            // Another thread checkpointed past our target meanwhile.
            return Ok(true);
        }

        debug_assert!(inner.flushed_to_disk_lsn >= oldest);

        if inner.n_pending_checkpoint_writes > 0 {
            // A checkpoint write is running.
            drop(inner);

            if sync {
                // Wait for it to complete.
                drop(self.checkpoint_lock.read());
            }

            return Ok(false);
        }

        inner.next_checkpoint_lsn = oldest;
        self.write_checkpoint_info(inner)?;

        Ok(true)
    }

    /// Makes a checkpoint at or after a specified LSN, preflushing dirty
    /// pages first. Pass `Lsn::MAX` for the latest possible LSN.
    pub fn make_checkpoint_at(&self, lsn: Lsn, write_always: bool) -> RedoResult<()> {
        // Flush as much as we can; retry while competing batches run.
        while !self.preflush_modified_pages(lsn)? {}

        while !self.checkpoint(true, write_always)? {}

        Ok(())
    }

    /// Registers bytes to be appended to the log on every checkpoint,
    /// returning the previously registered bytes.
    pub fn append_on_checkpoint(&self, buf: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.append_on_checkpoint, buf)
    }

    /// Writes the prepared checkpoint info to every group and completes
    /// the checkpoint.
    ///
    /// The checkpoint lock is held exclusively for the duration of the
    /// slot I/O; sync waiters acquire it shared to ride out completion.
    fn write_checkpoint_info(&self, mut inner: MutexGuard<'_, LogInner>) -> RedoResult<()> {
        let cp_lock = self.checkpoint_lock.write();

        let mut tokens = Vec::with_capacity(inner.groups.len());
        for group_idx in 0..inner.groups.len() {
            self.group_checkpoint(&mut inner, group_idx)?;
            tokens.push(IoToken::Checkpoint(group_idx));
        }

        drop(inner);

        for token in tokens {
            self.io_complete(token)?;
        }

        drop(cp_lock);

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Builds and issues the checkpoint block for one group.
    fn group_checkpoint(&self, inner: &mut LogInner, group_idx: usize) -> RedoResult<()> {
        let checkpoint_no = inner.next_checkpoint_no;
        let checkpoint_lsn = inner.next_checkpoint_lsn;
        let log_buf_size = inner.buf.size;

        tracing::debug!(
            checkpoint_no,
            checkpoint_lsn = %checkpoint_lsn,
            group = group_idx,
            "writing checkpoint info"
        );

        let (files, block) = {
            let group = &mut inner.groups[group_idx];
            let lsn_offset = group.calc_lsn_offset(checkpoint_lsn);
            let block = build_checkpoint_block(
                checkpoint_no,
                checkpoint_lsn,
                lsn_offset,
                log_buf_size,
            );
            group.checkpoint_buf.copy_from_slice(&block);
            (Arc::clone(group.files()), block)
        };

        inner.n_pending_checkpoint_writes += 1;
        self.stats.n_log_ios.fetch_add(1, Ordering::Relaxed);

        let slot = CheckpointSlot::for_checkpoint_no(checkpoint_no);
        files.write_at(0, slot.offset(), &block)?;

        Ok(())
    }

    /// Handles the completion of a log-space I/O.
    pub(crate) fn io_complete(&self, token: IoToken) -> RedoResult<()> {
        match token {
            IoToken::Checkpoint(group_idx) => {
                if self.config.flush_method.log_fsync_required() {
                    let files = {
                        let inner = self.inner.lock();
                        Arc::clone(inner.groups[group_idx].files())
                    };
                    files.fsync()?;
                }
                self.io_complete_checkpoint();
                Ok(())
            }
            IoToken::Data(_) => {
                // Log data writes complete synchronously inside the writer
                // and never come through here.
                debug_assert!(false, "unexpected data I/O completion");
                Ok(())
            }
        }
    }

    /// Accounts one finished checkpoint slot write; the last one completes
    /// the checkpoint.
    fn io_complete_checkpoint(&self) {
        let mut inner = self.inner.lock();

        debug_assert!(inner.n_pending_checkpoint_writes > 0);
        inner.n_pending_checkpoint_writes -= 1;

        if inner.n_pending_checkpoint_writes == 0 {
            inner.next_checkpoint_no += 1;
            inner.last_checkpoint_lsn = inner.next_checkpoint_lsn;

            tracing::debug!(
                last_checkpoint_lsn = %inner.last_checkpoint_lsn,
                flushed_to_disk_lsn = %inner.flushed_to_disk_lsn,
                "checkpoint completed"
            );
        }
    }

    /// Reads and validates one checkpoint slot of a group.
    pub fn read_checkpoint_info(
        &self,
        group_idx: usize,
        slot: CheckpointSlot,
    ) -> RedoResult<CheckpointInfo> {
        let files = {
            let inner = self.inner.lock();
            Arc::clone(inner.groups[group_idx].files())
        };

        self.stats.n_log_ios.fetch_add(1, Ordering::Relaxed);

        let mut buf = vec![0u8; LOG_BLOCK_SIZE];
        files.read_at(0, slot.offset(), &mut buf)?;

        decode_checkpoint_block(&buf, slot.offset())
    }

    /// Returns the most recent valid checkpoint of a group: the valid slot
    /// with the higher checkpoint number.
    pub fn latest_checkpoint(&self, group_idx: usize) -> RedoResult<CheckpointInfo> {
        let first = self.read_checkpoint_info(group_idx, CheckpointSlot::First);
        let second = self.read_checkpoint_info(group_idx, CheckpointSlot::Second);

        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if a.checkpoint_no >= b.checkpoint_no { a } else { b }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(_), Err(_)) => Err(RedoError::NoValidCheckpoint),
        }
    }
}
