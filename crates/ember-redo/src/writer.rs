//! Draining the log buffer to the file group.
//!
//! [`RedoLog::write_up_to`] is the single entry point: it coalesces the
//! pending buffer span into block-aligned file writes, pads them to the
//! storage's preferred I/O unit, crosses file boundaries (emitting the new
//! file's header first), and optionally makes the result durable before
//! publishing the watermarks to waiters.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ember_common::constants::{LOG_BLOCK_SIZE, LOG_FILE_HDR_SIZE};
use ember_common::Lsn;

use crate::block;
use crate::buffer::{align_down, align_up};
use crate::config::FlushMethod;
use crate::error::RedoResult;
use crate::files::LogFiles;
use crate::group::LogGroup;
use crate::log::{LogInner, RedoLog};

impl RedoLog {
    /// Ensures the log has been written to the files up to `lsn`, and made
    /// durable when `flush_to_disk` is set.
    ///
    /// Starts a new write, or waits when an already-running flush covers
    /// the request. On return with `flush_to_disk`, every byte below `lsn`
    /// is on stable storage; without it, every such byte has been issued to
    /// the OS in file order.
    pub fn write_up_to(&self, lsn: Lsn, flush_to_disk: bool) -> RedoResult<()> {
        // Dirty read of the published write LSN. Valid only for the
        // non-flushing check: the mutex also arbitrates fsync bandwidth,
        // so flushing callers always take it.
        if !flush_to_disk && self.write_lsn() >= lsn {
            return Ok(());
        }

        let mut loop_count = 0u32;

        loop {
            loop_count += 1;
            debug_assert!(loop_count < 128);

            let mut inner = self.inner.lock();

            let limit = if flush_to_disk {
                inner.flushed_to_disk_lsn
            } else {
                inner.write_lsn
            };
            if limit >= lsn {
                return Ok(());
            }

            if flush_to_disk && inner.n_pending_flushes > 0 {
                // Figure out whether the current flush will do the job for
                // us, then wait for it either way.
                let work_done = inner.current_flush_lsn >= lsn;

                while inner.n_pending_flushes > 0 {
                    self.flush_finished.wait(&mut inner);
                }
                drop(inner);

                if work_done {
                    return Ok(());
                }
                continue;
            }

            if !flush_to_disk && inner.buf.free == inner.buf.next_to_write {
                // Nothing to write and no flush to disk requested.
                return Ok(());
            }

            self.write_buffer_span(&mut inner, flush_to_disk)?;

            if !flush_to_disk {
                return Ok(());
            }

            // Only one flush runs at a time; we are it.
            debug_assert_eq!(inner.n_pending_flushes, 1);

            let file_handles: Vec<Arc<dyn LogFiles>> =
                inner.groups.iter().map(|g| Arc::clone(g.files())).collect();
            drop(inner);

            if self.config.flush_method.log_fsync_required() {
                for files in &file_handles {
                    files.fsync()?;
                }
            }

            let mut inner = self.inner.lock();
            // A concurrent write under an eager-durability flush method may
            // already have advanced the watermark past this flush's target.
            inner.flushed_to_disk_lsn = inner.flushed_to_disk_lsn.max(inner.current_flush_lsn);
            self.publish_flushed_lsn(inner.flushed_to_disk_lsn);
            inner.n_pending_flushes -= 1;
            self.flush_finished.notify_all();

            return Ok(());
        }
    }

    /// Issues the pending buffer span to every group and completes the
    /// write under the held mutex.
    fn write_buffer_span(&self, inner: &mut LogInner, flush_to_disk: bool) -> RedoResult<()> {
        if flush_to_disk {
            inner.n_pending_flushes += 1;
            inner.current_flush_lsn = inner.lsn;
        }

        let start_offset = inner.buf.next_to_write;
        let end_offset = inner.buf.free;
        let area_start = align_down(start_offset, LOG_BLOCK_SIZE);
        let area_end = align_up(end_offset, LOG_BLOCK_SIZE);
        debug_assert!(area_end > area_start);

        let next_checkpoint_no = inner.next_checkpoint_no;
        {
            let data = inner.buf.bytes_mut();
            block::set_flush_bit(&mut data[area_start..], true);
            block::set_checkpoint_no(&mut data[area_end - LOG_BLOCK_SIZE..], next_checkpoint_no);
        }

        // Pad the tail with zeros up to the next write-ahead boundary, so
        // subsequent writes stay aligned to the storage's optimal unit.
        let mut pad_size = 0usize;
        let write_ahead = self.config.write_ahead_size;
        if write_ahead > LOG_BLOCK_SIZE {
            let end_lsn_aligned =
                (inner.lsn.as_u64() + LOG_BLOCK_SIZE as u64 - 1) & !(LOG_BLOCK_SIZE as u64 - 1);
            let end_file_offset = inner.groups[0].calc_lsn_offset(Lsn::new(end_lsn_aligned));
            let end_offset_in_unit = (end_file_offset % write_ahead as u64) as usize;

            if end_offset_in_unit > 0 && (area_end - area_start) > end_offset_in_unit {
                pad_size = write_ahead - end_offset_in_unit;
                if area_end + pad_size > inner.buf.size {
                    pad_size = inner.buf.size - area_end;
                }
                let data = inner.buf.bytes_mut();
                data[area_end..area_end + pad_size].fill(0);
            }
        }

        let write_start_lsn =
            Lsn::new(inner.write_lsn.as_u64() & !(LOG_BLOCK_SIZE as u64 - 1));
        let new_data_offset = start_offset - area_start;

        for group_idx in 0..inner.groups.len() {
            self.group_write_buf(
                inner,
                group_idx,
                area_start,
                area_end + pad_size,
                write_start_lsn,
                new_data_offset,
            )?;
        }
        self.stats.padded_bytes.fetch_add(pad_size as u64, Ordering::Relaxed);

        // Write completion: publish the new watermark, re-anchor the
        // groups, and compact the buffer.
        inner.write_end_offset = inner.buf.free;
        inner.write_lsn = inner.lsn;
        let write_lsn = inner.write_lsn;
        for group in &mut inner.groups {
            group.set_fields(write_lsn);
        }
        let write_end_offset = inner.write_end_offset;
        inner.buf.compact(write_end_offset);
        self.publish_write_lsn(write_lsn);

        if matches!(
            self.config.flush_method,
            FlushMethod::ODsync | FlushMethod::AllODirect | FlushMethod::NoSync
        ) {
            // The OS did not buffer the log file at all, so what was
            // written is already as durable as it will get.
            inner.flushed_to_disk_lsn = inner.write_lsn;
            self.publish_flushed_lsn(inner.flushed_to_disk_lsn);
        }

        Ok(())
    }

    /// Writes the buffer span `[buf_start, buf_end)` to one group,
    /// splitting at file boundaries and stamping block checksums.
    fn group_write_buf(
        &self,
        inner: &mut LogInner,
        group_idx: usize,
        buf_start: usize,
        buf_end: usize,
        start_lsn: Lsn,
        new_data_offset: usize,
    ) -> RedoResult<()> {
        debug_assert_eq!((buf_end - buf_start) % LOG_BLOCK_SIZE, 0);
        debug_assert_eq!(start_lsn.as_u64() % LOG_BLOCK_SIZE as u64, 0);

        {
            let algorithm = self.config.checksum_algorithm;
            let data = inner.buf.bytes_mut();
            let mut offset = buf_start;
            while offset < buf_end {
                block::store_checksum(&mut data[offset..offset + LOG_BLOCK_SIZE], algorithm);
                offset += LOG_BLOCK_SIZE;
            }
        }

        let mut write_header = new_data_offset == 0;
        let mut start_lsn = start_lsn;
        let mut buf_offset = buf_start;
        let mut len = buf_end - buf_start;

        while len > 0 {
            let file_size = inner.groups[group_idx].file_size();
            let next_offset = inner.groups[group_idx].calc_lsn_offset(start_lsn);

            if write_header && next_offset % file_size == LOG_FILE_HDR_SIZE {
                // We start to write a new log file instance in the group.
                let nth_file = (next_offset / file_size) as usize;
                self.file_header_flush(&mut inner.groups[group_idx], nth_file, start_lsn)?;
            }

            let write_len = if (next_offset % file_size) + len as u64 > file_size {
                (file_size - next_offset % file_size) as usize
            } else {
                len
            };

            let (file_no, offset_in_file) = inner.groups[group_idx].split_offset(next_offset);
            let files = Arc::clone(inner.groups[group_idx].files());

            tracing::trace!(
                start_lsn = %start_lsn,
                group = group_idx,
                file_no,
                offset_in_file,
                write_len,
                "log write"
            );

            self.stats.n_log_ios.fetch_add(1, Ordering::Relaxed);
            files.write_at(
                file_no,
                offset_in_file,
                &inner.buf.bytes()[buf_offset..buf_offset + write_len],
            )?;
            self.stats
                .os_log_written
                .fetch_add(write_len as u64, Ordering::Relaxed);
            self.stats.log_writes.fetch_add(1, Ordering::Relaxed);

            if write_len < len {
                start_lsn = start_lsn.offset(write_len as u64);
                len -= write_len;
                buf_offset += write_len;
                write_header = true;
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Writes the header block of the nth file of a group.
    fn file_header_flush(
        &self,
        group: &mut LogGroup,
        nth_file: usize,
        start_lsn: Lsn,
    ) -> RedoResult<()> {
        tracing::debug!(
            start_lsn = %start_lsn,
            group = group.id(),
            nth_file,
            "writing log file header"
        );

        let files = Arc::clone(group.files());
        self.stats.n_log_ios.fetch_add(1, Ordering::Relaxed);
        files.write_at(nth_file, 0, group.stamp_file_header(nth_file, start_lsn))?;
        self.stats
            .os_log_written
            .fetch_add(LOG_BLOCK_SIZE as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Synchronously writes and flushes the log buffer up to the current
    /// end of the log.
    pub fn buffer_flush_to_disk(&self) -> RedoResult<()> {
        let lsn = self.inner.lock().lsn;
        self.write_up_to(lsn, true)
    }

    /// Writes the log buffer out in the background, flushing when asked.
    ///
    /// Skips the work entirely when a pending flush already covers the
    /// current end of the log.
    pub fn sync_in_background(&self, flush: bool) -> RedoResult<()> {
        let lsn = {
            let inner = self.inner.lock();

            if flush
                && inner.n_pending_flushes > 0
                && inner.current_flush_lsn >= inner.lsn
            {
                // The write + flush in flight will write enough.
                return Ok(());
            }

            inner.lsn
        };

        self.write_up_to(lsn, flush)
    }
}
