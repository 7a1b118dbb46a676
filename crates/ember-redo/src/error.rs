//! Redo log error types.

use std::io;
use thiserror::Error;

use ember_common::Lsn;

/// Result type for redo log operations.
pub type RedoResult<T> = Result<T, RedoError>;

/// Errors that can occur during redo log operations.
#[derive(Debug, Error)]
pub enum RedoError {
    /// I/O error on a log file. Redo log corruption is unrecoverable
    /// mid-flight, so callers are expected to abort the engine.
    #[error("redo log I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Configuration error detected at startup.
    #[error("redo log configuration error: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// The smallest log group cannot accommodate the configured thread
    /// concurrency. The engine cannot start.
    #[error(
        "log group capacity {capacity} is too small: {required} bytes must stay \
         reserved for concurrent mini-transactions; add log files or reduce \
         thread concurrency"
    )]
    GroupTooSmall {
        /// Usable capacity of the smallest group after the safety discount.
        capacity: u64,
        /// Reserved bytes derived from the thread concurrency.
        required: u64,
    },

    /// A log block failed checksum verification on read.
    #[error(
        "log block {block_no} checksum mismatch: stored {stored:#010x}, \
         computed {computed:#010x}"
    )]
    BlockChecksumMismatch {
        /// Block number from the block header.
        block_no: u32,
        /// Checksum stored in the block trailer.
        stored: u32,
        /// Checksum recomputed over the block contents.
        computed: u32,
    },

    /// A checkpoint slot does not contain a valid checkpoint.
    #[error("checkpoint slot at file offset {slot_offset} is invalid: {reason}")]
    CheckpointSlotInvalid {
        /// File offset of the slot that failed validation.
        slot_offset: u64,
        /// What failed.
        reason: String,
    },

    /// No valid checkpoint found in any slot of any group.
    #[error("no valid checkpoint found in the log files")]
    NoValidCheckpoint,

    /// A read request fell outside the log group.
    #[error("LSN range {start}..{end} is not addressable in the log group")]
    RangeNotAddressable {
        /// First LSN of the rejected range.
        start: Lsn,
        /// One past the last LSN of the rejected range.
        end: Lsn,
    },
}

impl RedoError {
    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a checkpoint slot validation error.
    pub fn checkpoint_slot_invalid(slot_offset: u64, reason: impl Into<String>) -> Self {
        Self::CheckpointSlotInvalid {
            slot_offset,
            reason: reason.into(),
        }
    }

    /// Returns true if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::BlockChecksumMismatch { .. }
                | Self::CheckpointSlotInvalid { .. }
                | Self::NoValidCheckpoint
        )
    }

    /// Returns true if the engine cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Config { .. } | Self::GroupTooSmall { .. }
        )
    }
}
