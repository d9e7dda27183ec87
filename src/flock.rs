//! Advisory locking for store files.
//!
//! Every store keeps a `<path>.lock` companion file whose exclusive lock is
//! held for the store's lifetime. The store's invariants only hold for a
//! single writer, so a second process opening the same file fails fast at
//! open instead of corrupting it later. Contention is reported as its own
//! condition, distinct from real I/O failures.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the exclusive lock guarding `store_path`, creating the
    /// companion lock file next to it. Fails when another process already
    /// holds the store. The owning process id is recorded in the file for
    /// debugging.
    pub fn acquire(store_path: &Path) -> Result<Self> {
        let path = lock_path(store_path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_exclusive(&file)? {
            return Err(Error::IO(format!(
                "{} is locked by another process",
                store_path.display()
            )));
        }

        // Stamp the pid only once the lock is ours, so a losing contender
        // never wipes the holder's entry.
        file.set_len(0)?;
        file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }
}

/// `<store path>.lock`.
fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Attempts a non-blocking exclusive lock. `Ok(false)` means another holder
/// has it; anything else wrong with the file is a real error.
#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.kind() {
        std::io::ErrorKind::WouldBlock => Ok(false),
        _ => Err(err.into()),
    }
}

#[cfg(windows)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let mut overlapped = unsafe { std::mem::zeroed() };
    let locked = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    };
    if locked != 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == ERROR_LOCK_VIOLATION as i32 => Ok(false),
        _ => Err(err.into()),
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock; the file itself is litter.
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}
