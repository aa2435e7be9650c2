//! Storage-wide file lock.
//!
//! One storage root is shared by every sw process on the machine. Commands
//! that mutate it (build, install, remove) hold the lock exclusively;
//! read-only commands (list, sdir) share it. An exclusive holder leaves a
//! one-line note in the lock file so a blocked invocation can report who
//! is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

const LOCK_FILENAME: &str = ".lock";

/// How a command uses the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Read-only commands; any number may run at once.
  Shared,
  /// Mutating commands; excludes everything else.
  Exclusive,
}

#[derive(Debug, Error)]
pub enum StorageLockError {
  #[error(
    "storage is in use by {owner}\n\
     If no sw process is running, remove the lock file:\n  {lock_path}"
  )]
  Busy { owner: String, lock_path: PathBuf },

  #[error("failed to take storage lock at {lock_path}: {source}")]
  Io {
    lock_path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A held storage lock; released on drop.
#[derive(Debug)]
pub struct StorageLock {
  _file: File,
  lock_path: PathBuf,
}

impl StorageLock {
  /// Take the lock under `root`, creating the directory if needed.
  ///
  /// `command` labels an exclusive hold; shared holders are anonymous.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, StorageLockError> {
    let lock_path = root.join(LOCK_FILENAME);

    if !root.exists() {
      std::fs::create_dir_all(root).map_err(|source| StorageLockError::Io {
        lock_path: lock_path.clone(),
        source,
      })?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StorageLockError::Io {
        lock_path: lock_path.clone(),
        source,
      })?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(StorageLockError::Busy {
          owner: read_owner(&lock_path),
          lock_path,
        });
      }
      return Err(StorageLockError::Io {
        lock_path,
        source: err,
      });
    }

    if mode == LockMode::Exclusive {
      write_owner(&file, command).map_err(|source| StorageLockError::Io {
        lock_path: lock_path.clone(),
        source,
      })?;
    }

    Ok(StorageLock { _file: file, lock_path })
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

/// Record the exclusive holder, e.g. `sw build (pid 4242)`.
fn write_owner(mut file: &File, command: &str) -> io::Result<()> {
  file.set_len(0)?;
  file.seek(SeekFrom::Start(0))?;
  writeln!(file, "sw {command} (pid {})", std::process::id())
}

/// Best-effort owner note from the lock file; stale after the exclusive
/// holder exits, absent while only readers ever held it.
fn read_owner(lock_path: &Path) -> String {
  let mut contents = String::new();
  if let Ok(mut file) = File::open(lock_path) {
    file.read_to_string(&mut contents).ok();
  }
  let line = contents.lines().next().unwrap_or("").trim();
  if line.is_empty() {
    "another process".to_string()
  } else {
    line.to_string()
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // LockFileEx locks one byte at offset zero and requires an OVERLAPPED,
  // which is plain data and valid zero-initialized.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
