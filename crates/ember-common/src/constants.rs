//! System-wide constants for EmberDB's redo log.
//!
//! The on-disk geometry constants are part of the log file format and must
//! never change for an existing deployment.

// =============================================================================
// Page Geometry
// =============================================================================

/// Engine page size in bytes (4 KB).
///
/// Data files are addressed in pages of this size; the redo margin
/// calculations reserve log space in page-sized units.
pub const PAGE_SIZE: usize = 4 * 1024;

// =============================================================================
// Log Block Geometry
// =============================================================================

/// Size of a redo log block, the unit of log file I/O (512 B).
pub const LOG_BLOCK_SIZE: usize = 512;

/// Size of the log block header.
///
/// The header contains: block number (4, high bit is the flush flag),
/// data length (2), first record group offset (2), checkpoint number (4).
pub const LOG_BLOCK_HDR_SIZE: usize = 12;

/// Size of the log block trailer (4-byte checksum).
pub const LOG_BLOCK_TRL_SIZE: usize = 4;

/// Payload capacity of a single log block.
pub const LOG_BLOCK_DATA_CAPACITY: usize =
    LOG_BLOCK_SIZE - LOG_BLOCK_HDR_SIZE - LOG_BLOCK_TRL_SIZE;

/// Offset of the block number field in the block header.
pub const LOG_BLOCK_HDR_NO: usize = 0;

/// Mask of the flush flag in the block number field.
pub const LOG_BLOCK_FLUSH_BIT_MASK: u32 = 0x8000_0000;

/// Offset of the data length field in the block header.
pub const LOG_BLOCK_HDR_DATA_LEN: usize = 4;

/// Offset of the first-record-group field in the block header.
pub const LOG_BLOCK_FIRST_REC_GROUP: usize = 6;

/// Offset of the checkpoint number field in the block header.
pub const LOG_BLOCK_CHECKPOINT_NO: usize = 8;

/// Offset of the trailing checksum within a block.
pub const LOG_BLOCK_CHECKSUM: usize = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE;

// =============================================================================
// Log File Header
// =============================================================================

/// Size of a log file header region (4 blocks).
///
/// The header region holds the file metadata block, the two checkpoint
/// slots, and reserved space. Log data starts at this offset in every file.
pub const LOG_FILE_HDR_SIZE: u64 = 4 * LOG_BLOCK_SIZE as u64;

/// Offset of the group id within the file header (4 B, big-endian).
pub const LOG_FILE_GROUP_ID: usize = 0;

/// Offset of the file start LSN within the file header (8 B, big-endian).
pub const LOG_FILE_START_LSN: usize = 4;

/// Offset of the backup tool label area within the file header.
///
/// Wiped with spaces on every header write so that a restored backup is not
/// mistaken for a live log file.
pub const LOG_FILE_BACKUP_LABEL: usize = 16;

/// Width of the wiped backup label area.
pub const LOG_FILE_BACKUP_LABEL_LEN: usize = 4;

/// Offset of the first checkpoint slot within a log file.
pub const LOG_CHECKPOINT_1: u64 = LOG_BLOCK_SIZE as u64;

/// Offset of the second checkpoint slot within a log file.
pub const LOG_CHECKPOINT_2: u64 = 3 * LOG_BLOCK_SIZE as u64;

/// LSN at which the logical log stream starts.
///
/// One block's worth of LSNs below this is never used, so every record has
/// a start LSN well above zero.
pub const LOG_START_LSN: u64 = 16 * LOG_BLOCK_SIZE as u64;

// =============================================================================
// Checkpoint Block Layout
// =============================================================================

/// Offset of the checkpoint number (8 B) in a checkpoint block.
pub const LOG_CHECKPOINT_NO: usize = 0;

/// Offset of the checkpoint LSN (8 B) in a checkpoint block.
pub const LOG_CHECKPOINT_LSN: usize = 8;

/// Offset of the low 32 bits of the checkpoint LSN's group offset.
pub const LOG_CHECKPOINT_OFFSET_LOW32: usize = 16;

/// Offset of the high 32 bits of the checkpoint LSN's group offset.
pub const LOG_CHECKPOINT_OFFSET_HIGH32: usize = 20;

/// Offset of the log buffer size field (4 B) in a checkpoint block.
pub const LOG_CHECKPOINT_LOG_BUF_SIZE: usize = 24;

/// Offset of the archived LSN field (8 B) in a checkpoint block.
///
/// Written as `Lsn::MAX` when archiving is off.
pub const LOG_CHECKPOINT_ARCHIVED_LSN: usize = 28;

/// Offset of the per-group info array (8 B per slot) in a checkpoint block.
pub const LOG_CHECKPOINT_GROUP_ARRAY: usize = 36;

/// Maximum number of log groups representable in a checkpoint block.
pub const LOG_MAX_N_GROUPS: usize = 32;

/// Offset of the first checkpoint checksum, covering bytes `[0, here)`.
pub const LOG_CHECKPOINT_CHECKSUM_1: usize =
    LOG_CHECKPOINT_GROUP_ARRAY + 8 * LOG_MAX_N_GROUPS;

/// Offset of the second checkpoint checksum, covering bytes
/// `[LOG_CHECKPOINT_LSN, here)`.
pub const LOG_CHECKPOINT_CHECKSUM_2: usize = LOG_CHECKPOINT_CHECKSUM_1 + 4;

/// Total size of the meaningful prefix of a checkpoint block.
pub const LOG_CHECKPOINT_SIZE: usize = LOG_CHECKPOINT_CHECKSUM_2 + 4;

// =============================================================================
// Log Record Markers
// =============================================================================

/// Record type byte of the checkpoint marker record.
pub const MLOG_CHECKPOINT: u8 = 57;

/// On-disk size of a checkpoint marker record (type byte + 8-byte LSN).
pub const SIZE_OF_MLOG_CHECKPOINT: usize = 9;

// =============================================================================
// Log Buffer Margins
// =============================================================================

/// Free-space margin required in the log buffer before a record is appended.
pub const LOG_BUF_WRITE_MARGIN: usize = 4 * LOG_BLOCK_SIZE;

/// Ratio of the buffer size at which a background write is triggered.
pub const LOG_BUF_FLUSH_RATIO: usize = 2;

/// Margin subtracted from the flush trigger point.
pub const LOG_BUF_FLUSH_MARGIN: usize = LOG_BUF_WRITE_MARGIN + 4 * PAGE_SIZE;

// =============================================================================
// Checkpoint Margins
// =============================================================================

/// Log space reserved per concurrent thread in the smallest group.
pub const LOG_CHECKPOINT_FREE_PER_THREAD: u64 = (4 * PAGE_SIZE) as u64;

/// Extra log space reserved in the smallest group.
pub const LOG_CHECKPOINT_EXTRA_FREE: u64 = (8 * PAGE_SIZE) as u64;

/// Divisor controlling when an asynchronous checkpoint is started.
pub const LOG_POOL_CHECKPOINT_RATIO_ASYNC: u64 = 32;

/// Divisor controlling synchronous preflushing of modified pages.
pub const LOG_POOL_PREFLUSH_RATIO_SYNC: u64 = 16;

/// Divisor controlling asynchronous preflushing of modified pages.
pub const LOG_POOL_PREFLUSH_RATIO_ASYNC: u64 = 8;

// =============================================================================
// Defaults
// =============================================================================

/// Default in-memory log buffer size (16 MB). Grown on demand.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default size of each log file, header included (48 MB).
pub const DEFAULT_LOG_FILE_SIZE: u64 = 48 * 1024 * 1024;

/// Default number of log files in the group.
pub const DEFAULT_LOG_FILES: usize = 2;

/// Default storage-aligned write unit for padded log writes (8 KB).
pub const DEFAULT_WRITE_AHEAD_SIZE: usize = 8 * 1024;

/// Largest accepted write-ahead unit (64 KB).
pub const MAX_WRITE_AHEAD_SIZE: usize = 64 * 1024;

/// Default number of concurrent threads assumed by the margin calculation.
pub const DEFAULT_THREAD_CONCURRENCY: usize = 8;
