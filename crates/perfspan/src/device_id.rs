//! Stable per-install device identifier.
//!
//! Several processes of the same application may start at once and race to
//! create the id. Reads are optimistic; creation takes an exclusive advisory
//! lock on the file, re-reads it (another process may have won), and only
//! then writes a fresh UUID.

use crate::error::PersistenceError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::warn;

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

#[derive(Serialize, Deserialize)]
struct DeviceIdFile {
    id: String,
}

/// Loads (creating on first use) the device id stored at a fixed path.
#[derive(Debug, Clone)]
pub struct DeviceIdFilePersistence {
    path: PathBuf,
}

impl DeviceIdFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored id, creating one if necessary. `None` if the file could
    /// not be read or written.
    pub fn load_device_id(&self) -> Option<String> {
        if let Some(id) = self.read_existing() {
            return Some(id);
        }
        match self.create() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "could not persist device id");
                None
            }
        }
    }

    fn read_existing(&self) -> Option<String> {
        let bytes = fs::read(&self.path).ok()?;
        parse_id(&bytes)
    }

    fn create(&self) -> Result<String, PersistenceError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;

        let _lock = FileLock::acquire(&file, &self.path)?;
        let mut handle = &file;

        // Another process may have written an id while we waited
        let mut existing = Vec::new();
        handle.read_to_end(&mut existing)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        if let Some(id) = parse_id(&existing) {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let json = serde_json::to_vec(&DeviceIdFile { id: id.clone() })?;
        file.set_len(0)
            .and_then(|()| handle.seek(SeekFrom::Start(0)))
            .and_then(|_| handle.write_all(&json))
            .and_then(|()| file.sync_data())
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        Ok(id)
    }
}

fn parse_id(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<DeviceIdFile>(bytes)
        .ok()
        .map(|file| file.id)
        .filter(|id| !id.is_empty())
}

/// Exclusive `flock` held until dropped.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self, PersistenceError> {
        for attempt in 0..LOCK_ATTEMPTS {
            if try_lock(file) {
                return Ok(Self { file });
            }
            if attempt + 1 < LOCK_ATTEMPTS {
                thread::sleep(LOCK_RETRY_DELAY);
            }
        }
        Err(PersistenceError::LockContended {
            path: path.to_owned(),
            attempts: LOCK_ATTEMPTS,
        })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        unlock(self.file);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file`, which outlives this call.
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above; unlocking a descriptor we hold a lock on.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> bool {
    true
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
