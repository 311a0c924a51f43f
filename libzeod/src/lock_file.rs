use crate::op::OpenError;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub(crate) const LOCK_FILE_NAME: &str = ".lock";

/// Exclusive `flock` on `<dir>/.lock`, released on drop.
pub(crate) struct LockFile {
  file: File,
}

impl LockFile {
  pub fn acquire(dir: &Path) -> Result<Self, OpenError> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(&path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
      let err = io::Error::last_os_error();
      return Err(match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => OpenError::Locked(path),
        _ => OpenError::Io(err),
      });
    };
    Ok(Self { file })
  }
}

impl Drop for LockFile {
  fn drop(&mut self) {
    unsafe {
      libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
    }
  }
}
