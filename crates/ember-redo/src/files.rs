//! Log file storage and data-file collaborator interfaces.
//!
//! The redo core addresses its files by `(file_no, offset)`; everything
//! below that - preallocation, positional I/O, fsync - lives behind the
//! [`LogFiles`] trait so tests and alternative backends can substitute it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use ember_common::Lsn;

use crate::error::{RedoError, RedoResult};

/// Completion token attributing a log-space I/O to its originator.
///
/// Carried through the I/O layer and handed back on completion so the
/// engine can tell a checkpoint-slot write from a data-block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoToken {
    /// A log data write for the group at this index.
    Data(usize),
    /// A checkpoint slot write for the group at this index.
    Checkpoint(usize),
}

/// Storage backend for one log group's files.
pub trait LogFiles: Send + Sync {
    /// Number of files in the group.
    fn n_files(&self) -> usize;

    /// Size of each file in bytes, header region included.
    fn file_size(&self) -> u64;

    /// Writes `buf` at `offset` within file `file_no`.
    fn write_at(&self, file_no: usize, offset: u64, buf: &[u8]) -> RedoResult<()>;

    /// Reads `buf.len()` bytes from `offset` within file `file_no`.
    fn read_at(&self, file_no: usize, offset: u64, buf: &mut [u8]) -> RedoResult<()>;

    /// Flushes all files of the group to stable storage.
    fn fsync(&self) -> RedoResult<()>;
}

/// Data-file collaborator used by checkpointing and shutdown.
///
/// The checkpoint protocol needs every data page written before the
/// checkpoint to be durable; clean shutdown stamps the final flushed LSN
/// into the data-file header.
pub trait DataFiles: Send + Sync {
    /// Flushes all tablespace files to stable storage.
    fn flush(&self) -> RedoResult<()>;

    /// Writes the flushed-up-to LSN into the data-file header.
    fn write_flushed_lsn(&self, lsn: Lsn) -> RedoResult<()>;
}

/// Data-file collaborator for deployments without data files (tests,
/// log-only tools). Every operation succeeds without doing anything.
#[derive(Debug, Default)]
pub struct NoDataFiles;

impl DataFiles for NoDataFiles {
    fn flush(&self) -> RedoResult<()> {
        Ok(())
    }

    fn write_flushed_lsn(&self, _lsn: Lsn) -> RedoResult<()> {
        Ok(())
    }
}

/// [`LogFiles`] backed by fixed-size files in a directory.
pub struct DirLogFiles {
    files: Vec<Mutex<File>>,
    file_size: u64,
}

impl DirLogFiles {
    /// Creates `n_files` zero-filled files of `file_size` bytes under `dir`,
    /// or opens them if they already exist with the right size.
    pub fn open_or_create(dir: &Path, n_files: usize, file_size: u64) -> RedoResult<Self> {
        std::fs::create_dir_all(dir)?;

        let mut files = Vec::with_capacity(n_files);
        for file_no in 0..n_files {
            let path = dir.join(format!("redo_{file_no:04}.log"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            let len = file.metadata()?.len();
            if len == 0 {
                file.set_len(file_size)?;
            } else if len != file_size {
                return Err(RedoError::config(format!(
                    "log file {} is {} bytes, expected {}",
                    path.display(),
                    len,
                    file_size
                )));
            }

            files.push(Mutex::new(file));
        }

        Ok(Self { files, file_size })
    }

    fn check_bounds(&self, file_no: usize, offset: u64, len: usize) -> RedoResult<()> {
        if file_no >= self.files.len() || offset + len as u64 > self.file_size {
            return Err(RedoError::config(format!(
                "log I/O out of bounds: file {file_no} offset {offset} len {len}"
            )));
        }
        Ok(())
    }
}

impl LogFiles for DirLogFiles {
    fn n_files(&self) -> usize {
        self.files.len()
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn write_at(&self, file_no: usize, offset: u64, buf: &[u8]) -> RedoResult<()> {
        self.check_bounds(file_no, offset, buf.len())?;

        let mut file = self.files[file_no].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn read_at(&self, file_no: usize, offset: u64, buf: &mut [u8]) -> RedoResult<()> {
        self.check_bounds(file_no, offset, buf.len())?;

        let mut file = self.files[file_no].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn fsync(&self) -> RedoResult<()> {
        for file in &self.files {
            file.lock().sync_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DirLogFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLogFiles")
            .field("n_files", &self.files.len())
            .field("file_size", &self.file_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_size() {
        let tmp = TempDir::new().unwrap();
        let files = DirLogFiles::open_or_create(tmp.path(), 3, 64 * 1024).unwrap();

        assert_eq!(files.n_files(), 3);
        assert_eq!(files.file_size(), 64 * 1024);
        for file_no in 0..3 {
            let path = tmp.path().join(format!("redo_{file_no:04}.log"));
            assert_eq!(std::fs::metadata(path).unwrap().len(), 64 * 1024);
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let files = DirLogFiles::open_or_create(tmp.path(), 2, 64 * 1024).unwrap();

        let payload = vec![0xABu8; 512];
        files.write_at(1, 2048, &payload).unwrap();
        files.fsync().unwrap();

        let mut out = vec![0u8; 512];
        files.read_at(1, 2048, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_reopen_existing() {
        let tmp = TempDir::new().unwrap();
        {
            let files = DirLogFiles::open_or_create(tmp.path(), 1, 32 * 1024).unwrap();
            files.write_at(0, 0, b"persisted").unwrap();
            files.fsync().unwrap();
        }

        let files = DirLogFiles::open_or_create(tmp.path(), 1, 32 * 1024).unwrap();
        let mut out = vec![0u8; 9];
        files.read_at(0, 0, &mut out).unwrap();
        assert_eq!(&out, b"persisted");
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        {
            DirLogFiles::open_or_create(tmp.path(), 1, 32 * 1024).unwrap();
        }
        let result = DirLogFiles::open_or_create(tmp.path(), 1, 64 * 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let tmp = TempDir::new().unwrap();
        let files = DirLogFiles::open_or_create(tmp.path(), 1, 4096).unwrap();

        assert!(files.write_at(0, 4096 - 100, &[0u8; 512]).is_err());
        assert!(files.write_at(1, 0, &[0u8; 512]).is_err());
    }
}
