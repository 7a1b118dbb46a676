//! In-memory log buffer.
//!
//! A contiguous byte region sized in block multiples, staging log records
//! until the writer drains them to the file group. Two cursors move through
//! it: `free` (where the next append lands) and `next_to_write` (the first
//! byte not yet issued to the files). The partial block containing `free`
//! always carries a valid header.

use ember_common::constants::{
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE, LOG_BUF_FLUSH_MARGIN,
    LOG_BUF_FLUSH_RATIO,
};
use ember_common::Lsn;

use crate::block;

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The log staging buffer. All access happens under the log mutex.
pub(crate) struct LogBuf {
    /// Backing storage. One block longer than `size` so that finalizing the
    /// last block of the logical region can initialize its successor header.
    data: Vec<u8>,
    /// Logical buffer size in bytes, a block multiple.
    pub size: usize,
    /// Append cursor.
    pub free: usize,
    /// Flush cursor; everything in `[next_to_write, free)` is pending.
    pub next_to_write: usize,
    /// Fill level at which a background write should be triggered.
    pub max_free: usize,
    /// Set while a thread is reallocating the buffer; other threads wait.
    pub is_extending: bool,
}

impl LogBuf {
    /// Creates a zeroed buffer of the given logical size.
    pub fn new(size: usize) -> Self {
        debug_assert_eq!(size % LOG_BLOCK_SIZE, 0);
        Self {
            data: vec![0u8; size + LOG_BLOCK_SIZE],
            size,
            free: 0,
            next_to_write: 0,
            max_free: size / LOG_BUF_FLUSH_RATIO - LOG_BUF_FLUSH_MARGIN,
            is_extending: false,
        }
    }

    /// Read access to the staged bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the staged bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Appends `payload` at the `free` cursor, splitting across block
    /// boundaries. Each block filled on the way is finalized (data length
    /// set to the full block size, checkpoint number stamped) and the next
    /// block's header initialized.
    ///
    /// Advances `lsn` by the payload length plus header-and-trailer bytes
    /// for every boundary crossed, and returns the new value.
    pub fn write_low(&mut self, lsn: Lsn, checkpoint_no: u64, payload: &[u8]) -> Lsn {
        let mut lsn = lsn.as_u64();
        let mut rest = payload;

        loop {
            let in_block = self.free % LOG_BLOCK_SIZE;
            let data_len_if_all = in_block + rest.len();

            // How much of the payload fits in the current block.
            let (data_len, len) = if data_len_if_all <= LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE {
                (data_len_if_all, rest.len())
            } else {
                (
                    LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE,
                    LOG_BLOCK_SIZE - in_block - LOG_BLOCK_TRL_SIZE,
                )
            };

            self.data[self.free..self.free + len].copy_from_slice(&rest[..len]);
            rest = &rest[len..];

            let block_start = align_down(self.free, LOG_BLOCK_SIZE);
            block::set_data_len(&mut self.data[block_start..], data_len);

            if data_len == LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE {
                // This block became full.
                block::set_data_len(&mut self.data[block_start..], LOG_BLOCK_SIZE);
                block::set_checkpoint_no(&mut self.data[block_start..], checkpoint_no);

                let advance = len + LOG_BLOCK_HDR_SIZE + LOG_BLOCK_TRL_SIZE;
                lsn += advance as u64;

                block::init(
                    &mut self.data[block_start + LOG_BLOCK_SIZE..],
                    Lsn::new(lsn),
                );
                self.free += advance;
            } else {
                lsn += len as u64;
                self.free += len;
            }

            debug_assert!(self.free <= self.size);

            if rest.is_empty() {
                return Lsn::new(lsn);
            }
        }
    }

    /// Replaces the backing storage with a larger region, preserving the
    /// tail partial block and rebasing both cursors to the new origin.
    ///
    /// The caller must have drained every full block first, so that `free`
    /// and `next_to_write` sit in the same block.
    pub fn grow(&mut self, new_size: usize) {
        debug_assert_eq!(new_size % LOG_BLOCK_SIZE, 0);
        debug_assert!(new_size > self.size);
        debug_assert_eq!(
            align_down(self.free, LOG_BLOCK_SIZE),
            align_down(self.next_to_write, LOG_BLOCK_SIZE)
        );

        let move_start = align_down(self.free, LOG_BLOCK_SIZE);
        let move_end = self.free;
        let tail = self.data[move_start..move_end].to_vec();

        self.free -= move_start;
        self.next_to_write -= move_start;

        self.data = vec![0u8; new_size + LOG_BLOCK_SIZE];
        self.size = new_size;
        self.max_free = new_size / LOG_BUF_FLUSH_RATIO - LOG_BUF_FLUSH_MARGIN;

        self.data[..tail.len()].copy_from_slice(&tail);
    }

    /// Completes a write that issued bytes up to `write_end_offset`: moves
    /// the flush cursor there and, once more than half of `max_free` has
    /// been drained, slides the remaining bytes back to offset 0.
    pub fn compact(&mut self, write_end_offset: usize) {
        self.next_to_write = write_end_offset;

        if write_end_offset > self.max_free / 2 {
            let move_start = align_down(write_end_offset, LOG_BLOCK_SIZE);
            let move_end = align_up(self.free, LOG_BLOCK_SIZE);

            self.data.copy_within(move_start..move_end, 0);
            self.free -= move_start;
            self.next_to_write -= move_start;
        }
    }
}
