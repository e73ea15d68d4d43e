//! Advisory lock file serializing segment open/create/destroy across processes

use crate::error::{ProcStateError, ProcStateResult};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Bounded wait for the lock file
pub const FILE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Exclusive `flock` held until drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) and exclusively lock `path`, retrying for up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> ProcStateResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                log::error!("could not open lock file {}: {}", path.display(), e);
                ProcStateError::Io(e)
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: the fd is owned by `file` and open for the duration of the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                _ => {
                    log::error!("flock on {} failed: {}", path.display(), err);
                    return Err(ProcStateError::Os {
                        op: "flock",
                        source: err,
                    });
                }
            }

            if Instant::now() >= deadline {
                log::error!(
                    "could not get file lock {} within {:?}",
                    path.display(),
                    timeout
                );
                return Err(ProcStateError::LockTimeout(path.display().to_string()));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the fd is still owned by self.file
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN | libc::LOCK_NB) };
        if rc != 0 {
            log::error!(
                "could not unlock file {}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
}
