//! Per-fingerprint build locks.
//!
//! A build of fingerprint `<hex>` holds an exclusive OS lock on
//! `staging/<hex>.lock` for as long as its token lives. The lock is what
//! keeps two caches (or two processes) opened on one directory from building
//! the same fingerprint at once; the in-memory reservation table only covers
//! callers sharing one [`PackageCache`](super::PackageCache).
//!
//! Lock files are never deleted. Unlinking a lock file while another process
//! waits on it would let two holders coexist.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A held build lock. Released when dropped.
#[derive(Debug)]
pub(super) struct BuildLock {
  _file: File,
  path: PathBuf,
}

impl BuildLock {
  /// Take the lock at `path` without blocking. `Ok(None)` if someone else holds it.
  pub(super) fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
    let file = open(path)?;
    match lock(&file, false) {
      Ok(()) => Ok(Some(Self {
        _file: file,
        path: path.to_path_buf(),
      })),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(e) => Err(e),
    }
  }

  pub(super) fn path(&self) -> &Path {
    &self.path
  }
}

/// Block until whoever holds `path` lets go. The lock is not kept.
pub(super) fn wait_released(path: &Path) -> io::Result<()> {
  let file = open(path)?;
  lock(&file, true)
}

fn open(path: &Path) -> io::Result<File> {
  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
}

#[cfg(unix)]
fn lock(file: &File, blocking: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = if blocking {
    FlockOperation::LockExclusive
  } else {
    FlockOperation::NonBlockingLockExclusive
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock(file: &File, blocking: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = if blocking {
    LOCKFILE_EXCLUSIVE_LOCK
  } else {
    LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY
  };

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized,
  // and the handle stays open for the duration of the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result != 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    return Err(io::ErrorKind::WouldBlock.into());
  }
  Err(err)
}
