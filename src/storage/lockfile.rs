//! Lock files compatible with containers/storage.
//!
//! Writers take an exclusive POSIX fcntl lock on the lock file and, once
//! their change is on disk, stamp the file with a fresh 64-byte "last write"
//! token so that other readers (podman included) notice the store changed.
//! The token holds, little-endian, the write time in nanoseconds since the
//! epoch (8 bytes), a write counter (8 bytes) and the writer's pid (4 bytes),
//! followed by 44 random bytes.
//!
//! fcntl locks are exactly the primitive that some networked filesystems get
//! wrong, which is why mutating runs normally operate on a local mirror of the
//! store (see [`crate::mirror`]).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rustix::fs::{fcntl_lock, FlockOperation};

/// Bytes at the start of a lock file holding the token.
const LAST_WRITE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// fcntl refused the lock.
    #[error("lock operation on {} failed: {source}", path.display())]
    LockFailed {
        path: PathBuf,
        #[source]
        source: rustix::io::Errno,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// The token stamped into a lock file by the most recent writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWrite {
    timestamp_nanos: u64,
    /// Incremented by every writer.
    counter: u64,
    pid: u32,
    random: [u8; 44],
}

impl LastWrite {
    fn from_bytes(buf: &[u8; LAST_WRITE_SIZE]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let timestamp_nanos = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[8..16]);
        let counter = u64::from_le_bytes(word);
        let mut half = [0u8; 4];
        half.copy_from_slice(&buf[16..20]);
        let pid = u32::from_le_bytes(half);
        let mut random = [0u8; 44];
        random.copy_from_slice(&buf[20..64]);

        Self {
            timestamp_nanos,
            counter,
            pid,
            random,
        }
    }

    fn to_bytes(&self) -> [u8; LAST_WRITE_SIZE] {
        let mut buf = [0u8; LAST_WRITE_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
        buf[16..20].copy_from_slice(&self.pid.to_le_bytes());
        buf[20..64].copy_from_slice(&self.random);
        buf
    }

    /// Produces the token that follows `self`.
    fn next(&self) -> Self {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut random = [0u8; 44];
        rand::rng().fill(&mut random[..]);
        Self {
            timestamp_nanos,
            counter: self.counter.wrapping_add(1),
            pid: std::process::id(),
            random,
        }
    }
}

impl Default for LastWrite {
    fn default() -> Self {
        Self {
            timestamp_nanos: 0,
            counter: 0,
            pid: 0,
            random: [0u8; 44],
        }
    }
}

/// One of a store's lock files, kept open for the store's lifetime.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

/// An exclusive lock on a [`LockFile`], released on drop.
#[derive(Debug)]
pub struct WLockGuard<'a> {
    lockfile: &'a LockFile,
}

impl Drop for WLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(&self.lockfile.file, FlockOperation::Unlock);
    }
}

impl WLockGuard<'_> {
    /// Stamps the lock file with a new LastWrite token, signalling to other
    /// users of the store that its contents changed.
    pub fn record_write(&self) -> Result<LastWrite> {
        let next = self.lockfile.get_last_write()?.next();
        self.lockfile
            .file
            .write_all_at(&next.to_bytes(), 0)
            .map_err(|source| self.lockfile.io_error(source))?;
        Ok(next)
    }
}

impl LockFile {
    /// Opens the lock file at `path`, creating an empty one if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the exclusive lock is held.
    pub fn lock(&self) -> Result<WLockGuard<'_>> {
        fcntl_lock(&self.file, FlockOperation::LockExclusive).map_err(|source| {
            LockError::LockFailed {
                path: self.path.clone(),
                source,
            }
        })?;
        Ok(WLockGuard { lockfile: self })
    }

    /// Reads the token currently in the file.
    pub fn get_last_write(&self) -> Result<LastWrite> {
        let mut buf = [0u8; LAST_WRITE_SIZE];
        match self.file.read_exact_at(&mut buf, 0) {
            Ok(()) => Ok(LastWrite::from_bytes(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // never written
                Ok(LastWrite::default())
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
