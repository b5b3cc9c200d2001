//! Durable write helpers: atomic replace and advisory file locking.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes `bytes` to `path` via a sibling temp file and an atomic rename.
///
/// The destination either keeps its previous contents or holds the complete
/// new contents; a crash mid-write never leaves a torn file behind.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

/// An exclusive advisory lock on a file, released on drop.
///
/// Advisory only: it coordinates cooperating processes that agree to take
/// the lock before touching the guarded files.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, blocking until the holder releases it.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = Self::lock_file(path)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Acquired advisory lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Attempts the lock without blocking; `None` if another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = Self::lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "Released advisory lock");
    }
}
