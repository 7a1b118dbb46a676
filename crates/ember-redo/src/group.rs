//! Log group: a logical log addressed by LSN, stored as a ring of
//! fixed-size files.
//!
//! Every file starts with a header region (metadata block plus the two
//! checkpoint slots); the usable capacity of the group is
//! `n_files * (file_size - header)`. LSNs wrap within that capacity, and
//! the `(lsn, lsn_offset)` pair kept in the group anchors the mapping from
//! an LSN to its physical byte position.

use std::sync::Arc;

use bytes::BufMut;

use ember_common::constants::{
    LOG_BLOCK_SIZE, LOG_FILE_BACKUP_LABEL, LOG_FILE_BACKUP_LABEL_LEN, LOG_FILE_HDR_SIZE,
    LOG_START_LSN,
};
use ember_common::Lsn;

use crate::files::LogFiles;

/// Health state of a log group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// The group is usable.
    Ok,
    /// The group failed a consistency check and must not be written.
    Corrupted,
}

/// One log group.
pub struct LogGroup {
    /// Group id, stamped into file headers and checkpoint info.
    id: u32,
    /// Health state.
    pub(crate) state: GroupState,
    /// An LSN whose physical position is known; anchors offset mapping.
    pub(crate) lsn: Lsn,
    /// Byte offset of `lsn` within the group, file headers included.
    pub(crate) lsn_offset: u64,
    /// Storage backend.
    files: Arc<dyn LogFiles>,
    /// Per-file header blocks, stamped by the writer when a write crosses
    /// into a file.
    file_header_bufs: Vec<Vec<u8>>,
    /// Scratch block for building checkpoint info.
    pub(crate) checkpoint_buf: Vec<u8>,
}

impl LogGroup {
    /// Creates a group over the given files, anchored at the log start LSN.
    pub fn new(id: u32, files: Arc<dyn LogFiles>) -> Self {
        let n_files = files.n_files();
        Self {
            id,
            state: GroupState::Ok,
            lsn: Lsn::new(LOG_START_LSN),
            lsn_offset: LOG_FILE_HDR_SIZE,
            files,
            file_header_bufs: vec![vec![0u8; LOG_BLOCK_SIZE]; n_files],
            checkpoint_buf: vec![0u8; LOG_BLOCK_SIZE],
        }
    }

    /// Group id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of files in the group.
    #[must_use]
    pub fn n_files(&self) -> usize {
        self.files.n_files()
    }

    /// Size of each file, header included.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.files.file_size()
    }

    /// Storage backend of this group.
    #[must_use]
    pub fn files(&self) -> &Arc<dyn LogFiles> {
        &self.files
    }

    /// Data capacity of the group, file headers excluded.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        (self.file_size() - LOG_FILE_HDR_SIZE) * self.n_files() as u64
    }

    /// Strips the per-file header padding out of a real group offset.
    fn calc_size_offset(&self, offset: u64) -> u64 {
        offset - LOG_FILE_HDR_SIZE * (1 + offset / self.file_size())
    }

    /// Adds the per-file header padding back onto a size offset.
    fn calc_real_offset(&self, offset: u64) -> u64 {
        offset + LOG_FILE_HDR_SIZE * (1 + offset / (self.file_size() - LOG_FILE_HDR_SIZE))
    }

    /// Calculates the byte position of an LSN within the group, file
    /// headers included.
    #[must_use]
    pub fn calc_lsn_offset(&self, lsn: Lsn) -> u64 {
        let gr_lsn = self.lsn.as_u64();
        let gr_lsn_size_offset = self.calc_size_offset(self.lsn_offset);
        let group_size = self.capacity();
        let lsn = lsn.as_u64();

        let difference = if lsn >= gr_lsn {
            lsn - gr_lsn
        } else {
            group_size - (gr_lsn - lsn) % group_size
        };

        let offset = (gr_lsn_size_offset + difference) % group_size;

        self.calc_real_offset(offset)
    }

    /// Re-anchors the group's `(lsn, lsn_offset)` pair at the given LSN.
    ///
    /// The current pair must already be consistent, for instance from a
    /// checkpoint LSN.
    pub fn set_fields(&mut self, lsn: Lsn) {
        self.lsn_offset = self.calc_lsn_offset(lsn);
        self.lsn = lsn;
    }

    /// Splits a group offset into `(file_no, offset_within_file)`.
    #[must_use]
    pub fn split_offset(&self, offset: u64) -> (usize, u64) {
        (
            (offset / self.file_size()) as usize,
            offset % self.file_size(),
        )
    }

    /// Stamps the header block for the nth file and returns it for writing.
    ///
    /// The header records the group id and the LSN at which the file's data
    /// area starts; the backup tool label area is wiped with spaces.
    pub fn stamp_file_header(&mut self, nth_file: usize, start_lsn: Lsn) -> &[u8] {
        let buf = &mut self.file_header_bufs[nth_file];

        let mut cursor = &mut buf[..];
        cursor.put_u32(self.id);
        cursor.put_u64(start_lsn.as_u64());

        for byte in
            &mut buf[LOG_FILE_BACKUP_LABEL..LOG_FILE_BACKUP_LABEL + LOG_FILE_BACKUP_LABEL_LEN]
        {
            *byte = 0x20;
        }

        &self.file_header_bufs[nth_file]
    }
}

impl std::fmt::Debug for LogGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGroup")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("lsn", &self.lsn)
            .field("lsn_offset", &self.lsn_offset)
            .field("n_files", &self.n_files())
            .field("file_size", &self.file_size())
            .finish()
    }
}

/// Locates an LSN in a set of log files laid out from `first_header_lsn`.
///
/// Returns the file number and the offset inside that file, header
/// included. Unlike [`LogGroup::calc_lsn_offset`] this needs no live group
/// state, so offline tooling can use it on closed files.
#[must_use]
pub fn calc_where_lsn_is(
    first_header_lsn: Lsn,
    lsn: Lsn,
    n_files: usize,
    file_size: u64,
) -> (usize, u64) {
    let capacity = file_size - LOG_FILE_HDR_SIZE;
    let ring = capacity * n_files as u64;
    let first = first_header_lsn.as_u64();
    let mut lsn = lsn.as_u64();

    if lsn < first {
        let add_this_many = 1 + (first - lsn) / ring;
        lsn += add_this_many * ring;
    }

    let file_no = ((lsn - first) / capacity) as usize % n_files;
    let offset_in_file = (lsn - first) % capacity + LOG_FILE_HDR_SIZE;

    (file_no, offset_in_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RedoResult;

    /// Minimal in-memory backend so offset math can be tested without disk.
    struct FixedGeometry {
        n_files: usize,
        file_size: u64,
    }

    impl LogFiles for FixedGeometry {
        fn n_files(&self) -> usize {
            self.n_files
        }
        fn file_size(&self) -> u64 {
            self.file_size
        }
        fn write_at(&self, _: usize, _: u64, _: &[u8]) -> RedoResult<()> {
            Ok(())
        }
        fn read_at(&self, _: usize, _: u64, _: &mut [u8]) -> RedoResult<()> {
            Ok(())
        }
        fn fsync(&self) -> RedoResult<()> {
            Ok(())
        }
    }

    fn test_group(n_files: usize, file_size: u64) -> LogGroup {
        LogGroup::new(
            0,
            Arc::new(FixedGeometry { n_files, file_size }),
        )
    }

    #[test]
    fn test_capacity() {
        let group = test_group(2, 1024 * 1024);
        assert_eq!(group.capacity(), 2 * (1024 * 1024 - LOG_FILE_HDR_SIZE));
    }

    #[test]
    fn test_start_lsn_maps_to_first_data_byte() {
        let group = test_group(2, 1024 * 1024);
        assert_eq!(
            group.calc_lsn_offset(Lsn::new(LOG_START_LSN)),
            LOG_FILE_HDR_SIZE
        );
    }

    #[test]
    fn test_offset_advances_with_lsn() {
        let group = test_group(2, 1024 * 1024);
        let base = group.calc_lsn_offset(Lsn::new(LOG_START_LSN));
        assert_eq!(
            group.calc_lsn_offset(Lsn::new(LOG_START_LSN + 4096)),
            base + 4096
        );
    }

    #[test]
    fn test_offset_skips_next_file_header() {
        let file_size = 64 * 1024;
        let group = test_group(2, file_size);
        let data_per_file = file_size - LOG_FILE_HDR_SIZE;

        // The first LSN past the first file's data area lands right after
        // the second file's header.
        let lsn = Lsn::new(LOG_START_LSN + data_per_file);
        assert_eq!(group.calc_lsn_offset(lsn), file_size + LOG_FILE_HDR_SIZE);
    }

    #[test]
    fn test_offset_wraps_around_group() {
        let file_size = 64 * 1024;
        let group = test_group(2, file_size);
        let capacity = group.capacity();

        let lsn = Lsn::new(LOG_START_LSN + capacity);
        assert_eq!(group.calc_lsn_offset(lsn), LOG_FILE_HDR_SIZE);
    }

    #[test]
    fn test_offset_before_anchor() {
        let file_size = 64 * 1024;
        let mut group = test_group(2, file_size);
        group.set_fields(Lsn::new(LOG_START_LSN + 10_000));

        // An LSN one ring below the anchor maps to the same position.
        let anchored = group.calc_lsn_offset(Lsn::new(LOG_START_LSN + 10_000));
        let below = group.calc_lsn_offset(Lsn::new(LOG_START_LSN + 10_000 - group.capacity()));
        assert_eq!(anchored, below);
    }

    #[test]
    fn test_set_fields_consistent() {
        let file_size = 64 * 1024;
        let mut group = test_group(3, file_size);

        let lsn = Lsn::new(LOG_START_LSN + 100_000);
        let expected = group.calc_lsn_offset(lsn);
        group.set_fields(lsn);

        assert_eq!(group.lsn, lsn);
        assert_eq!(group.lsn_offset, expected);
        // Re-anchoring does not move the mapping.
        assert_eq!(group.calc_lsn_offset(lsn), expected);
    }

    #[test]
    fn test_split_offset() {
        let group = test_group(2, 64 * 1024);
        assert_eq!(group.split_offset(2048), (0, 2048));
        assert_eq!(group.split_offset(64 * 1024 + 4096), (1, 4096));
    }

    #[test]
    fn test_stamp_file_header() {
        let mut group = test_group(2, 64 * 1024);
        let header = group.stamp_file_header(1, Lsn::new(LOG_START_LSN));

        assert_eq!(&header[0..4], &0u32.to_be_bytes());
        assert_eq!(&header[4..12], &LOG_START_LSN.to_be_bytes());
        assert_eq!(
            &header[LOG_FILE_BACKUP_LABEL..LOG_FILE_BACKUP_LABEL + LOG_FILE_BACKUP_LABEL_LEN],
            &[0x20; LOG_FILE_BACKUP_LABEL_LEN]
        );
    }

    #[test]
    fn test_calc_where_lsn_is() {
        let file_size = 64 * 1024u64;
        let capacity = file_size - LOG_FILE_HDR_SIZE;
        let first = Lsn::new(LOG_START_LSN);

        // Start of the ring.
        assert_eq!(
            calc_where_lsn_is(first, first, 2, file_size),
            (0, LOG_FILE_HDR_SIZE)
        );

        // Into the second file.
        assert_eq!(
            calc_where_lsn_is(first, first.offset(capacity + 100), 2, file_size),
            (1, LOG_FILE_HDR_SIZE + 100)
        );

        // Wrapped past the whole ring.
        assert_eq!(
            calc_where_lsn_is(first, first.offset(2 * capacity), 2, file_size),
            (0, LOG_FILE_HDR_SIZE)
        );

        // Below the first header LSN: resolved modulo the ring.
        assert_eq!(
            calc_where_lsn_is(first.offset(2 * capacity), first.offset(capacity), 2, file_size),
            (1, LOG_FILE_HDR_SIZE)
        );
    }
}
