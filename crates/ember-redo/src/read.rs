//! Reading log segments back from the file group.
//!
//! Recovery and log-shipping tools read block-aligned LSN ranges; the log
//! mutex is held only while the range is translated to file positions, not
//! across the I/O itself.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ember_common::constants::LOG_BLOCK_SIZE;
use ember_common::Lsn;

use crate::error::{RedoError, RedoResult};
use crate::log::RedoLog;

impl RedoLog {
    /// Reads the log byte range `[start_lsn, end_lsn)` of a group into
    /// `buf`, following the ring across file boundaries.
    ///
    /// Both LSNs must be block-aligned and `buf` must hold the range.
    pub fn read_log_seg(
        &self,
        buf: &mut [u8],
        group_idx: usize,
        start_lsn: Lsn,
        end_lsn: Lsn,
    ) -> RedoResult<()> {
        if end_lsn <= start_lsn
            || start_lsn.as_u64() % LOG_BLOCK_SIZE as u64 != 0
            || end_lsn.as_u64() % LOG_BLOCK_SIZE as u64 != 0
            || buf.len() < (end_lsn.as_u64() - start_lsn.as_u64()) as usize
        {
            return Err(RedoError::RangeNotAddressable {
                start: start_lsn,
                end: end_lsn,
            });
        }

        let mut start = start_lsn.as_u64();
        let end = end_lsn.as_u64();
        let mut buf_offset = 0usize;

        while start < end {
            // Translate under the mutex, release it before the read.
            let (files, file_no, offset_in_file, len) = {
                let inner = self.inner.lock();
                let group = &inner.groups[group_idx];

                let source_offset = group.calc_lsn_offset(Lsn::new(start));
                let file_size = group.file_size();

                let mut len = (end - start) as usize;
                if (source_offset % file_size) + len as u64 > file_size {
                    len = (file_size - source_offset % file_size) as usize;
                }

                let (file_no, offset_in_file) = group.split_offset(source_offset);
                (Arc::clone(group.files()), file_no, offset_in_file, len)
            };

            self.stats.n_log_ios.fetch_add(1, Ordering::Relaxed);
            files.read_at(file_no, offset_in_file, &mut buf[buf_offset..buf_offset + len])?;

            start += len as u64;
            buf_offset += len;
        }

        Ok(())
    }
}
