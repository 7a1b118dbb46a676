//! Redo log configuration.

use std::path::PathBuf;

use ember_common::constants::{
    DEFAULT_LOG_BUFFER_SIZE, DEFAULT_LOG_FILES, DEFAULT_LOG_FILE_SIZE,
    DEFAULT_THREAD_CONCURRENCY, DEFAULT_WRITE_AHEAD_SIZE, LOG_BLOCK_SIZE,
    LOG_BUF_FLUSH_MARGIN, LOG_BUF_FLUSH_RATIO, LOG_FILE_HDR_SIZE,
    MAX_WRITE_AHEAD_SIZE, PAGE_SIZE,
};

use crate::checksum::ChecksumAlgorithm;

/// How log and data file writes reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMethod {
    /// Buffered writes followed by explicit fsync.
    #[default]
    Fsync,
    /// Files opened with O_DSYNC; the OS flushes on every write.
    ODsync,
    /// Direct I/O for data files, explicit fsync for the log.
    ODirect,
    /// Direct I/O without the trailing fsync for data files.
    ODirectNoFsync,
    /// fsync only the metadata-bearing writes.
    LittleSync,
    /// Direct I/O for both data and log files.
    AllODirect,
    /// Never sync. Unsafe; for benchmarking only.
    NoSync,
}

impl FlushMethod {
    /// Whether the log writer must call fsync after writing log blocks.
    ///
    /// With O_DSYNC or direct unbuffered log writes the OS has already made
    /// the bytes durable when the write returns.
    #[must_use]
    pub fn log_fsync_required(self) -> bool {
        !matches!(self, Self::ODsync | Self::AllODirect | Self::NoSync)
    }

    /// Whether data files must be fsynced before a checkpoint is written.
    #[must_use]
    pub fn data_fsync_required(self) -> bool {
        !matches!(self, Self::NoSync | Self::AllODirect)
    }
}

/// Strategy for advancing the oldest dirty page past a target LSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreflushStrategy {
    /// Issue one flush batch and wait for it.
    #[default]
    Sync,
    /// Wait for the page cleaner with randomized exponential backoff.
    ExpBackoff,
}

/// Configuration for the redo log core.
#[derive(Debug, Clone)]
pub struct RedoConfig {
    /// Directory where the log files are stored.
    pub dir: PathBuf,

    /// Number of log files in the group.
    pub n_files: usize,

    /// Size of each log file in bytes, header region included.
    pub file_size: u64,

    /// Initial size of the in-memory log buffer. Grown on demand when a
    /// single mini-transaction needs more than half of it.
    pub buffer_size: usize,

    /// Storage-aligned write unit. Log writes that do not end on a boundary
    /// of this size are padded with zeros up to the next boundary.
    pub write_ahead_size: usize,

    /// Number of threads that may concurrently generate log. Used to reserve
    /// free space in the group for in-flight mini-transactions.
    pub thread_concurrency: usize,

    /// How writes reach stable storage.
    pub flush_method: FlushMethod,

    /// Trailer checksum algorithm for log blocks.
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Whether the changed-page tracking watermark participates in the
    /// margin checks.
    pub track_changed_pages: bool,

    /// Strategy for dirty-page preflushing.
    pub preflush_strategy: PreflushStrategy,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/redo"),
            n_files: DEFAULT_LOG_FILES,
            file_size: DEFAULT_LOG_FILE_SIZE,
            buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            write_ahead_size: DEFAULT_WRITE_AHEAD_SIZE,
            thread_concurrency: DEFAULT_THREAD_CONCURRENCY,
            flush_method: FlushMethod::default(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            track_changed_pages: false,
            preflush_strategy: PreflushStrategy::default(),
        }
    }
}

impl RedoConfig {
    /// Creates a new configuration with the specified log directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Sets the number of log files.
    #[must_use]
    pub fn with_n_files(mut self, n_files: usize) -> Self {
        self.n_files = n_files;
        self
    }

    /// Sets the size of each log file (header included).
    #[must_use]
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Sets the initial log buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the storage-aligned write unit.
    #[must_use]
    pub fn with_write_ahead_size(mut self, write_ahead_size: usize) -> Self {
        self.write_ahead_size = write_ahead_size;
        self
    }

    /// Sets the assumed thread concurrency.
    #[must_use]
    pub fn with_thread_concurrency(mut self, threads: usize) -> Self {
        self.thread_concurrency = threads;
        self
    }

    /// Sets the flush method.
    #[must_use]
    pub fn with_flush_method(mut self, method: FlushMethod) -> Self {
        self.flush_method = method;
        self
    }

    /// Sets the block checksum algorithm.
    #[must_use]
    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = algorithm;
        self
    }

    /// Enables or disables changed-page tracking.
    #[must_use]
    pub fn with_track_changed_pages(mut self, track: bool) -> Self {
        self.track_changed_pages = track;
        self
    }

    /// Sets the preflush strategy.
    #[must_use]
    pub fn with_preflush_strategy(mut self, strategy: PreflushStrategy) -> Self {
        self.preflush_strategy = strategy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_files == 0 {
            return Err("at least one log file is required".to_string());
        }

        if self.file_size <= LOG_FILE_HDR_SIZE {
            return Err(format!(
                "log file size must exceed the {LOG_FILE_HDR_SIZE}-byte header"
            ));
        }

        if (self.file_size - LOG_FILE_HDR_SIZE) % LOG_BLOCK_SIZE as u64 != 0 {
            return Err("log file data area must be a multiple of the block size".to_string());
        }

        if self.buffer_size < 16 * LOG_BLOCK_SIZE || self.buffer_size < 4 * PAGE_SIZE {
            return Err(format!(
                "log buffer must be at least {} bytes",
                (16 * LOG_BLOCK_SIZE).max(4 * PAGE_SIZE)
            ));
        }

        if self.buffer_size / LOG_BUF_FLUSH_RATIO <= LOG_BUF_FLUSH_MARGIN {
            return Err(format!(
                "log buffer must exceed {} bytes to leave a usable flush margin",
                LOG_BUF_FLUSH_RATIO * LOG_BUF_FLUSH_MARGIN
            ));
        }

        if self.buffer_size % LOG_BLOCK_SIZE != 0 {
            return Err("log buffer size must be a multiple of the block size".to_string());
        }

        if !self.write_ahead_size.is_power_of_two()
            || self.write_ahead_size < LOG_BLOCK_SIZE
            || self.write_ahead_size > MAX_WRITE_AHEAD_SIZE
        {
            return Err(format!(
                "write-ahead size must be a power of two in [{LOG_BLOCK_SIZE}, \
                 {MAX_WRITE_AHEAD_SIZE}]"
            ));
        }

        if self.thread_concurrency == 0 {
            return Err("thread concurrency must be positive".to_string());
        }

        Ok(())
    }

    /// Returns the path of the nth log file.
    pub fn file_path(&self, file_no: usize) -> PathBuf {
        self.dir.join(format!("redo_{file_no:04}.log"))
    }
}
