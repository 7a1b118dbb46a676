//! Margin controller.
//!
//! Three free-space margins keep the log from overwriting data it still
//! needs: room in the staging buffer, distance from the oldest dirty page
//! in the buffer pool, and distance from the last checkpoint. As
//! thresholds are crossed, the controller schedules background writes,
//! preflushes dirty pages, or forces checkpoints.

use std::time::Duration;

use rand::Rng;

use ember_common::constants::{
    LOG_CHECKPOINT_EXTRA_FREE, LOG_CHECKPOINT_FREE_PER_THREAD, LOG_POOL_CHECKPOINT_RATIO_ASYNC,
    LOG_POOL_PREFLUSH_RATIO_ASYNC, LOG_POOL_PREFLUSH_RATIO_SYNC,
};
use ember_common::Lsn;

use crate::config::PreflushStrategy;
use crate::error::{RedoError, RedoResult};
use crate::log::{LogInner, RedoLog};

impl RedoLog {
    /// Derives the margin thresholds from the group geometry.
    ///
    /// Fails when the smallest group cannot reserve enough free space for
    /// the configured thread concurrency; the engine must not start in
    /// that case.
    pub(crate) fn calc_max_ages(inner: &mut LogInner, threads: usize) -> RedoResult<()> {
        let mut smallest_capacity = u64::MAX;
        for group in &inner.groups {
            smallest_capacity = smallest_capacity.min(group.capacity());
        }

        // Extra safety: use only nine tenths of the capacity.
        let smallest_capacity = smallest_capacity - smallest_capacity / 10;

        // Each concurrent thread must be able to fit the log entries of a
        // single query step into the reserved free space; running out of
        // log space mid-step cannot be recovered from.
        let free = LOG_CHECKPOINT_FREE_PER_THREAD * (10 + threads as u64)
            + LOG_CHECKPOINT_EXTRA_FREE;
        if free >= smallest_capacity / 2 {
            return Err(RedoError::GroupTooSmall {
                capacity: smallest_capacity,
                required: free,
            });
        }

        let margin = smallest_capacity - free;
        let margin = margin - margin / 10;

        inner.log_group_capacity = smallest_capacity;

        inner.max_modified_age_async = margin - margin / LOG_POOL_PREFLUSH_RATIO_ASYNC;
        inner.max_modified_age_sync = margin - margin / LOG_POOL_PREFLUSH_RATIO_SYNC;
        inner.max_checkpoint_age_async = margin - margin / LOG_POOL_CHECKPOINT_RATIO_ASYNC;
        inner.max_checkpoint_age = margin;

        Ok(())
    }

    /// Keeps a big enough free-space margin in the log buffer: schedules a
    /// non-flushing write of everything staged so far once the buffer fill
    /// crosses `max_buf_free`.
    pub fn flush_margin(&self) -> RedoResult<()> {
        let lsn = {
            let inner = self.inner.lock();
            if inner.buf.free > inner.buf.max_free {
                Some(inner.lsn)
            } else {
                None
            }
        };

        if let Some(lsn) = lsn {
            // We can write during flush.
            self.write_up_to(lsn, false)?;
        }

        Ok(())
    }

    /// Keeps a big enough free-space margin in the log group: preflushes
    /// dirty pages and checkpoints as the age thresholds are crossed.
    ///
    /// May only be called while the caller owns no log synchronization
    /// objects.
    pub fn checkpoint_margin(&self) -> RedoResult<()> {
        loop {
            let mut advance = 0u64;
            let oldest_lsn;
            let do_checkpoint;
            let checkpoint_sync;

            {
                let mut inner = self.inner.lock();

                if !inner.check_flush_or_checkpoint {
                    return Ok(());
                }

                oldest_lsn = self.pool.oldest_modification().unwrap_or(inner.lsn);

                let age = inner.lsn.diff(oldest_lsn);
                if age > inner.max_modified_age_sync {
                    // A flush is urgent: synchronous preflush, overshooting
                    // the threshold so we do not come right back here.
                    advance = 2 * (age - inner.max_modified_age_sync);
                }

                let checkpoint_age = inner.lsn.diff(inner.last_checkpoint_lsn);

                if checkpoint_age > inner.max_checkpoint_age {
                    // A checkpoint is urgent: do it synchronously.
                    checkpoint_sync = true;
                    do_checkpoint = true;
                } else if checkpoint_age > inner.max_checkpoint_age_async {
                    // Not urgent: start it and let it complete on its own.
                    do_checkpoint = true;
                    checkpoint_sync = false;
                    inner.check_flush_or_checkpoint = false;
                } else {
                    do_checkpoint = false;
                    checkpoint_sync = false;
                    inner.check_flush_or_checkpoint = false;
                }
            }

            if advance != 0 {
                let new_oldest = oldest_lsn.offset(advance);
                let success = self.preflush_modified_pages(new_oldest)?;

                if !success {
                    // Another thread was flushing at the same time; let the
                    // next pass re-evaluate.
                    self.inner.lock().check_flush_or_checkpoint = true;
                    continue;
                }
            }

            if do_checkpoint {
                self.checkpoint(checkpoint_sync, false)?;

                if checkpoint_sync {
                    continue;
                }
            }

            return Ok(());
        }
    }

    /// Asks the buffer pool to advance its oldest modification to at least
    /// `new_oldest`.
    ///
    /// Returns false when a flush batch of the same type was already
    /// running, meaning this thread's request was not served.
    pub(crate) fn preflush_modified_pages(&self, new_oldest: Lsn) -> RedoResult<bool> {
        if self.config.preflush_strategy == PreflushStrategy::Sync || new_oldest == Lsn::MAX {
            let (started, pages) = self.pool.flush_to_lsn(new_oldest);
            if started && pages > 0 {
                tracing::debug!(target_lsn = %new_oldest, pages, "preflushed dirty pages");
            }
            return Ok(started);
        }

        // Exponential backoff: let the page cleaner do the work, sleeping
        // random intervals that double up to a cap while no batch runs.
        let mut current = self.pool.oldest_modification();
        let mut step = 0u32;

        while let Some(oldest) = current {
            if oldest >= new_oldest {
                break;
            }

            while !self.pool.flush_in_progress() {
                let cap = 1u64 << step;
                let sleep_us = rand::thread_rng().gen_range(0..=cap);
                std::thread::sleep(Duration::from_micros(sleep_us));
                step = (step + 1) % 16;
            }

            while self.pool.flush_in_progress() {
                std::thread::yield_now();
            }

            current = self.pool.oldest_modification();
        }

        Ok(current.map_or(true, |oldest| oldest >= new_oldest))
    }

    /// Checks that there is enough free space in the log for a new query
    /// step, flushing the buffer or checkpointing as necessary.
    ///
    /// May only be called while the caller owns no log synchronization
    /// objects.
    pub fn check_margins(&self) -> RedoResult<()> {
        loop {
            self.flush_margin()?;
            self.checkpoint_margin()?;

            {
                let inner = self.inner.lock();
                if self.tracking_margin_exceeded(&inner, 0) {
                    drop(inner);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }

            let check = self.inner.lock().check_flush_or_checkpoint;
            if !check {
                return Ok(());
            }
        }
    }
}
