//! Buffer pool collaborator interface.
//!
//! The redo core never touches pages itself; it only needs to know the
//! oldest unflushed modification and to ask for dirty pages below a target
//! LSN to be flushed. Implementations must not call back into the redo log
//! while servicing these methods.

use ember_common::Lsn;

/// Dirty-page view of the buffer pool, as seen by the redo log.
pub trait BufferPool: Send + Sync {
    /// The smallest LSN at which any page was modified and not yet flushed,
    /// or `None` when the pool holds no dirty pages.
    fn oldest_modification(&self) -> Option<Lsn>;

    /// Flushes dirty pages with modification LSN below `target` and waits
    /// for the batch to end.
    ///
    /// Returns `(started, pages_flushed)`; `started` is false when a flush
    /// batch was already running, in which case the caller retries after
    /// that batch ends.
    fn flush_to_lsn(&self, target: Lsn) -> (bool, usize);

    /// Whether a flush-list batch is currently running.
    fn flush_in_progress(&self) -> bool;

    /// Whether every page in the pool is clean. Used by shutdown.
    fn all_clean(&self) -> bool;
}

/// Buffer pool stand-in with no dirty pages, ever.
///
/// Used by tests and log-only tools; with it, the oldest modification
/// always falls back to the current end of the log.
#[derive(Debug, Default)]
pub struct CleanBufferPool;

impl BufferPool for CleanBufferPool {
    fn oldest_modification(&self) -> Option<Lsn> {
        None
    }

    fn flush_to_lsn(&self, _target: Lsn) -> (bool, usize) {
        (true, 0)
    }

    fn flush_in_progress(&self) -> bool {
        false
    }

    fn all_clean(&self) -> bool {
        true
    }
}
