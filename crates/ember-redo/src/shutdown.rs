//! Shutdown quiescence.
//!
//! Clean shutdown drains the redo pipeline in phases: wait for the page
//! cleaner and for pending log I/O, checkpoint at the latest LSN, verify
//! the log is fully quiescent, then flush everything and stamp the final
//! flushed LSN into the data-file header. The stamp is what tells the next
//! startup that no crash recovery is needed - which is exactly why the
//! "very fast" mode must never write it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ember_common::Lsn;

use crate::error::RedoResult;
use crate::log::{RedoLog, SHUTDOWN_CLEANUP, SHUTDOWN_FLUSH_PHASE, SHUTDOWN_LAST_PHASE};

/// How much work shutdown is allowed to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Flush the buffer pool, checkpoint at the latest LSN, and stamp the
    /// data files. The next startup is clean.
    #[default]
    Normal,
    /// Flush only the log. The buffer pool is not flushed and the data
    /// files keep their old stamp, so the next startup runs crash
    /// recovery over the durable log.
    VeryFast,
}

impl RedoLog {
    /// Quiesces the redo log and brings the on-disk state to a shutdown-
    /// consistent point. Returns the final LSN.
    ///
    /// The caller must have stopped all producers first; this function
    /// only drains what is already in flight.
    pub fn shutdown(&self, mode: ShutdownMode) -> RedoResult<Lsn> {
        tracing::info!(?mode, "starting redo log shutdown");
        self.shutdown_state.store(SHUTDOWN_CLEANUP, Ordering::Release);

        // Let the page cleaner finish the batch it is running.
        self.shutdown_state
            .store(SHUTDOWN_FLUSH_PHASE, Ordering::Release);
        let mut ticks = 0u32;
        while self.pool.flush_in_progress() {
            std::thread::sleep(Duration::from_millis(100));
            ticks += 1;
            if ticks % 600 == 0 {
                tracing::info!("waiting for the page cleaner to finish flushing");
            }
        }

        loop {
            // Drain pending log flushes and checkpoint slot writes.
            loop {
                let (pending_checkpoint, pending_flush) = {
                    let inner = self.inner.lock();
                    (inner.n_pending_checkpoint_writes, inner.n_pending_flushes)
                };
                if pending_checkpoint == 0 && pending_flush == 0 {
                    break;
                }

                std::thread::sleep(Duration::from_millis(100));
                ticks += 1;
                if ticks % 600 == 0 {
                    tracing::info!(
                        pending_checkpoint_writes = pending_checkpoint,
                        pending_log_flushes = pending_flush,
                        "waiting for pending log I/O"
                    );
                }
            }

            if mode == ShutdownMode::VeryFast {
                tracing::info!(
                    "very fast shutdown: the buffer pool is not flushed to the data \
                     files; the next startup will run crash recovery"
                );

                // All committed work must still be recoverable, so the log
                // itself is flushed. The data-file LSN stamp is skipped:
                // startup deduces from the stamps whether the previous
                // shutdown was clean.
                self.buffer_flush_to_disk()?;

                self.shutdown_state
                    .store(SHUTDOWN_LAST_PHASE, Ordering::Release);

                let lsn = self.inner.lock().lsn;
                tracing::info!(lsn = %lsn, "redo log shutdown complete (very fast)");
                return Ok(lsn);
            }

            self.make_checkpoint_at(Lsn::MAX, true)?;

            let (lsn, is_quiescent) = {
                let inner = self.inner.lock();
                let tracked_caught_up = !self.tracking_enabled()
                    || self.tracked_lsn() == inner.last_checkpoint_lsn;
                debug_assert!(inner.lsn >= inner.last_checkpoint_lsn);
                (
                    inner.lsn,
                    inner.lsn == inner.last_checkpoint_lsn && tracked_caught_up,
                )
            };

            if !is_quiescent {
                // Something moved the log after the checkpoint; start over.
                continue;
            }

            if !self.pool.all_clean() {
                std::thread::sleep(Duration::from_millis(100));
                ticks += 1;
                if ticks % 600 == 0 {
                    tracing::info!("waiting for dirty buffer pages to be flushed");
                }
                continue;
            }

            // Flush the log files and the data files, then stamp the final
            // flushed LSN into the data-file header. The stamp bypasses the
            // buffer pool, which is why the pool had to be clean first.
            let file_handles: Vec<_> = {
                let inner = self.inner.lock();
                inner.groups.iter().map(|g| Arc::clone(g.files())).collect()
            };
            for files in &file_handles {
                files.fsync()?;
            }
            self.data_files.flush()?;

            self.shutdown_state
                .store(SHUTDOWN_LAST_PHASE, Ordering::Release);

            debug_assert_eq!(self.inner.lock().lsn, lsn);

            self.data_files.write_flushed_lsn(lsn)?;
            self.data_files.flush()?;

            tracing::info!(lsn = %lsn, "redo log shutdown complete");
            return Ok(lsn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedoConfig;
    use crate::error::RedoResult;
    use crate::files::{DataFiles, NoDataFiles};
    use crate::pool::CleanBufferPool;
    use ember_common::constants::LOG_FILE_HDR_SIZE;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records the LSN stamp so tests can see whether shutdown wrote it.
    #[derive(Default)]
    struct RecordingDataFiles {
        stamped: Mutex<Option<Lsn>>,
    }

    impl DataFiles for RecordingDataFiles {
        fn flush(&self) -> RedoResult<()> {
            Ok(())
        }

        fn write_flushed_lsn(&self, lsn: Lsn) -> RedoResult<()> {
            *self.stamped.lock() = Some(lsn);
            Ok(())
        }
    }

    fn test_log(dir: &std::path::Path, data_files: Arc<dyn DataFiles>) -> RedoLog {
        let config = RedoConfig::new(dir)
            .with_n_files(2)
            .with_file_size(1024 * 1024 + LOG_FILE_HDR_SIZE)
            .with_buffer_size(128 * 1024)
            .with_thread_concurrency(4);
        RedoLog::create(config, Arc::new(CleanBufferPool), data_files).unwrap()
    }

    fn append(log: &RedoLog, bytes: &[u8]) -> Lsn {
        let mut mtr = log.reserve_and_open(bytes.len()).unwrap();
        mtr.write(bytes);
        mtr.close()
    }

    #[test]
    fn test_normal_shutdown_quiesces_and_stamps() {
        let tmp = TempDir::new().unwrap();
        let data_files = Arc::new(RecordingDataFiles::default());
        let log = test_log(tmp.path(), Arc::clone(&data_files) as Arc<dyn DataFiles>);

        append(&log, &[0x42u8; 5000]);
        let final_lsn = log.shutdown(ShutdownMode::Normal).unwrap();

        // Fully quiescent: everything logged is checkpointed and durable.
        assert_eq!(final_lsn, log.lsn());
        assert_eq!(log.last_checkpoint_lsn(), final_lsn);
        assert!(log.flushed_to_disk_lsn() >= final_lsn);
        assert_eq!(*data_files.stamped.lock(), Some(final_lsn));
    }

    #[test]
    fn test_very_fast_shutdown_skips_stamp() {
        let tmp = TempDir::new().unwrap();
        let data_files = Arc::new(RecordingDataFiles::default());
        let log = test_log(tmp.path(), Arc::clone(&data_files) as Arc<dyn DataFiles>);

        let end = append(&log, &[0x43u8; 5000]);
        let final_lsn = log.shutdown(ShutdownMode::VeryFast).unwrap();

        // The log is durable, but the data files were not stamped.
        assert!(final_lsn >= end);
        assert!(log.flushed_to_disk_lsn() >= end);
        assert_eq!(*data_files.stamped.lock(), None);
    }

    #[test]
    fn test_normal_shutdown_idempotent_log_state() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path(), Arc::new(NoDataFiles));

        append(&log, &[0x44u8; 100]);
        let first = log.shutdown(ShutdownMode::Normal).unwrap();
        let second = log.shutdown(ShutdownMode::Normal).unwrap();

        // A second shutdown finds the log already quiescent.
        assert_eq!(first, second);
    }
}
