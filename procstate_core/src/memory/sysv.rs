// System V shared memory backend
//
// The segment and its lock semaphore share one IPC key derived with ftok()
// from the lock file. The lock file is flock()ed around open/create/destroy so
// that attach counting and stale detection never race with another process.
// Semaphore operations use SEM_UNDO so the kernel releases the lock of a
// process that dies while holding it.

use crate::error::{ProcStateError, ProcStateResult};
use crate::memory::file_lock::{FileLock, FILE_LOCK_TIMEOUT};
use crate::memory::platform::SegmentKey;
use crate::memory::segment::{init_header, SegmentBackend, SEGMENT_HEADER_SIZE};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Project id passed to ftok()
const FTOK_PROJECT_ID: libc::c_int = 1234;

const IPC_PERMISSIONS: libc::c_int = 0o666;

/// Semaphore value of an unlocked segment (locked is 0)
const SEM_UNLOCKED: libc::c_int = 1;

#[derive(Debug)]
pub(crate) struct SysvSegment {
    name: String,
    lock_file: PathBuf,
    shm_id: libc::c_int,
    sem_id: libc::c_int,
    addr: *mut u8,
}

// SAFETY: the mapping is process-wide and stays valid until detach, which
// requires &mut self; all cross-thread access is serialized by the semaphore
unsafe impl Send for SysvSegment {}
unsafe impl Sync for SysvSegment {}

fn os_err(op: &'static str, name: &str) -> ProcStateError {
    let err = ProcStateError::last_os(op);
    log::error!("({}) {}", name, err);
    err
}

fn shm_stat(shm_id: libc::c_int, name: &str) -> ProcStateResult<libc::shmid_ds> {
    // SAFETY: shmid_ds is plain data; IPC_STAT fills it completely on success
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    // SAFETY: ds is a valid, writable shmid_ds
    let rc = unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) };
    if rc == -1 {
        return Err(os_err("shmctl(IPC_STAT)", name));
    }
    Ok(ds)
}

fn sem_value(sem_id: libc::c_int, name: &str) -> ProcStateResult<libc::c_int> {
    // SAFETY: GETVAL takes no argument beyond the semaphore index
    let value = unsafe { libc::semctl(sem_id, 0, libc::GETVAL) };
    if value == -1 {
        return Err(os_err("semctl(GETVAL)", name));
    }
    Ok(value)
}

fn sem_reset(sem_id: libc::c_int, name: &str) -> ProcStateResult<()> {
    // SETVAL also clears the undo adjustments every process holds for it
    // SAFETY: SETVAL reads the int member of semun passed as the variadic argument
    let rc = unsafe { libc::semctl(sem_id, 0, libc::SETVAL, SEM_UNLOCKED) };
    if rc == -1 {
        return Err(os_err("semctl(SETVAL)", name));
    }
    Ok(())
}

fn sem_op(sem_id: libc::c_int, delta: libc::c_short) -> libc::c_int {
    let mut op = libc::sembuf {
        sem_num: 0,
        sem_op: delta,
        sem_flg: libc::SEM_UNDO as libc::c_short,
    };
    // SAFETY: op is a valid sembuf array of length 1
    unsafe { libc::semop(sem_id, &mut op, 1) }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl SysvSegment {
    fn open_semaphore(ipc_key: libc::key_t, name: &str) -> ProcStateResult<libc::c_int> {
        // SAFETY: plain syscall with integer arguments
        let sem_id = unsafe { libc::semget(ipc_key, 1, IPC_PERMISSIONS) };
        if sem_id != -1 {
            log::debug!("({}) got existing semaphore id {}", name, sem_id);
            return Ok(sem_id);
        }
        if last_errno() != libc::ENOENT {
            return Err(os_err("semget", name));
        }

        // SAFETY: plain syscall with integer arguments
        let sem_id =
            unsafe { libc::semget(ipc_key, 1, libc::IPC_CREAT | libc::IPC_EXCL | IPC_PERMISSIONS) };
        if sem_id == -1 {
            return Err(os_err("semget(IPC_CREAT)", name));
        }
        sem_reset(sem_id, name)?;
        log::debug!("({}) created semaphore id {}", name, sem_id);
        Ok(sem_id)
    }

    fn create_segment(ipc_key: libc::key_t, total: usize, name: &str) -> ProcStateResult<libc::c_int> {
        // SAFETY: plain syscall with integer arguments
        let shm_id = unsafe {
            libc::shmget(
                ipc_key,
                total,
                libc::IPC_CREAT | libc::IPC_EXCL | IPC_PERMISSIONS,
            )
        };
        if shm_id == -1 {
            return Err(os_err("shmget(IPC_CREAT)", name));
        }
        Ok(shm_id)
    }

    fn remove_segment(shm_id: libc::c_int, name: &str) -> ProcStateResult<()> {
        // SAFETY: IPC_RMID ignores the buffer argument
        let rc = unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(os_err("shmctl(IPC_RMID)", name));
        }
        Ok(())
    }

    fn remove_semaphore(sem_id: libc::c_int, name: &str) -> ProcStateResult<()> {
        // SAFETY: IPC_RMID takes no further argument
        let rc = unsafe { libc::semctl(sem_id, 0, libc::IPC_RMID) };
        if rc == -1 {
            return Err(os_err("semctl(IPC_RMID)", name));
        }
        Ok(())
    }

    /// Look up an existing segment, heal it if stale, or create a new one.
    /// Returns the segment id and whether it is freshly created.
    fn find_or_create(
        ipc_key: libc::key_t,
        sem_id: libc::c_int,
        total: usize,
        name: &str,
    ) -> ProcStateResult<(libc::c_int, bool)> {
        // size 0 finds a segment of any size
        // SAFETY: plain syscall with integer arguments
        let shm_id = unsafe { libc::shmget(ipc_key, 0, IPC_PERMISSIONS) };
        if shm_id == -1 {
            if last_errno() != libc::ENOENT {
                return Err(os_err("shmget", name));
            }
            let shm_id = Self::create_segment(ipc_key, total, name)?;
            // nobody is attached, so nobody can legitimately hold the lock
            if sem_value(sem_id, name)? != SEM_UNLOCKED {
                log::warn!("({}) semaphore without segment was locked, resetting", name);
                sem_reset(sem_id, name)?;
            }
            log::debug!("({}) created segment id {} of {} bytes", name, shm_id, total);
            return Ok((shm_id, true));
        }

        let ds = shm_stat(shm_id, name)?;
        log::debug!(
            "({}) found segment id {}, size {}, attached {}",
            name,
            shm_id,
            ds.shm_segsz,
            ds.shm_nattch
        );

        if ds.shm_nattch == 0 {
            log::warn!("({}) detected stale shared memory segment {}", name, shm_id);
            if sem_value(sem_id, name)? != SEM_UNLOCKED {
                log::error!("({}) semaphore of stale segment was unexpectedly locked", name);
                sem_reset(sem_id, name)?;
            }
            Self::remove_segment(shm_id, name)?;
            let shm_id = Self::create_segment(ipc_key, total, name)?;
            log::info!(
                "({}) deleted stale segment and created new one with id {}",
                name,
                shm_id
            );
            return Ok((shm_id, true));
        }

        if ds.shm_segsz as usize != total {
            log::error!(
                "({}) existing segment has size {} but {} was requested, configuration problem?",
                name,
                ds.shm_segsz,
                total
            );
            return Err(ProcStateError::Config(format!(
                "segment {} exists with size {} bytes, requested {} bytes",
                name,
                ds.shm_segsz as usize - SEGMENT_HEADER_SIZE.min(ds.shm_segsz as usize),
                total - SEGMENT_HEADER_SIZE
            )));
        }

        Ok((shm_id, false))
    }

    fn attachments_of(&self) -> ProcStateResult<usize> {
        Ok(shm_stat(self.shm_id, &self.name)?.shm_nattch as usize)
    }

    fn shm_detach(&mut self) {
        if self.addr.is_null() {
            return;
        }
        // SAFETY: addr was returned by shmat and not detached yet
        let rc = unsafe { libc::shmdt(self.addr as *const libc::c_void) };
        if rc == -1 {
            let _ = os_err("shmdt", &self.name);
        }
        self.addr = std::ptr::null_mut();
    }
}

impl SegmentBackend for SysvSegment {
    fn open_or_create(key: &SegmentKey, net_size: usize) -> ProcStateResult<Self> {
        let name = key.to_string();
        let total = net_size + SEGMENT_HEADER_SIZE;

        log::debug!("({}) opening lock file {}", name, key.lock_file().display());
        let _file_lock = FileLock::acquire(key.lock_file(), FILE_LOCK_TIMEOUT)?;

        let path = CString::new(key.lock_file().as_os_str().as_bytes()).map_err(|e| {
            ProcStateError::InvalidInput(format!("lock file path contains NUL: {}", e))
        })?;
        // SAFETY: path is a valid NUL-terminated string naming an existing file
        let ipc_key = unsafe { libc::ftok(path.as_ptr(), FTOK_PROJECT_ID) };
        if ipc_key == -1 {
            return Err(os_err("ftok", &name));
        }
        log::trace!("({}) using IPC key {:#x}", name, ipc_key);

        let sem_id = Self::open_semaphore(ipc_key, &name)?;
        let (shm_id, created) = Self::find_or_create(ipc_key, sem_id, total, &name)?;

        // SAFETY: shm_id names a live segment; a null address lets the kernel choose
        let addr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            let err = os_err("shmat", &name);
            if created {
                let _ = Self::remove_segment(shm_id, &name);
            }
            return Err(err);
        }
        let addr = addr as *mut u8;

        if created {
            // SAFETY: freshly created mapping of `total` bytes, not yet visible to
            // anyone else because the file lock is still held
            unsafe { init_header(addr, net_size) };
            log::debug!("({}) initialized header of new segment", name);
        }

        Ok(Self {
            name,
            lock_file: key.lock_file().to_path_buf(),
            shm_id,
            sem_id,
            addr,
        })
    }

    fn base(&self) -> *mut u8 {
        self.addr
    }

    fn lock(&self) -> ProcStateResult<()> {
        loop {
            if sem_op(self.sem_id, -1) == 0 {
                return Ok(());
            }
            if last_errno() != libc::EINTR {
                return Err(os_err("semop(lock)", &self.name));
            }
        }
    }

    fn unlock(&self) -> ProcStateResult<()> {
        if sem_op(self.sem_id, 1) == -1 {
            return Err(os_err("semop(unlock)", &self.name));
        }
        Ok(())
    }

    fn attachments(&self) -> ProcStateResult<usize> {
        self.attachments_of()
    }

    fn detach_or_destroy(&mut self) {
        if self.addr.is_null() {
            return;
        }

        let file_lock = match FileLock::acquire(&self.lock_file, FILE_LOCK_TIMEOUT) {
            Ok(lock) => Some(lock),
            Err(e) => {
                log::error!("({}) detaching without file lock: {}", self.name, e);
                None
            }
        };

        self.shm_detach();

        // destroying without the file lock could race with a concurrent open
        if file_lock.is_none() {
            return;
        }

        match self.attachments_of() {
            Ok(0) => {
                log::debug!("({}) destroying segment id {}", self.name, self.shm_id);
                if Self::remove_segment(self.shm_id, &self.name).is_ok() {
                    log::debug!("({}) destroying semaphore id {}", self.name, self.sem_id);
                    let _ = Self::remove_semaphore(self.sem_id, &self.name);
                }
            }
            Ok(n) => log::trace!("({}) not destroying segment, {} still attached", self.name, n),
            Err(_) => {}
        }
    }

    fn detach_without_cleanup(&mut self) {
        let _file_lock = FileLock::acquire(&self.lock_file, FILE_LOCK_TIMEOUT)
            .map_err(|e| log::error!("({}) detaching without file lock: {}", self.name, e))
            .ok();
        self.shm_detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prefix: &str) -> SegmentKey {
        let app = format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        SegmentKey::derive("sysv", Some(&app)).unwrap()
    }

    #[test]
    fn attach_count_tracks_attachers() {
        let key = key("sysv_count");
        let mut a = SysvSegment::open_or_create(&key, 512).unwrap();
        assert_eq!(a.attachments().unwrap(), 1);

        let mut b = SysvSegment::open_or_create(&key, 512).unwrap();
        assert_eq!(a.attachments().unwrap(), 2);
        assert_eq!(a.shm_id, b.shm_id);

        b.detach_or_destroy();
        assert_eq!(a.attachments().unwrap(), 1);
        a.detach_or_destroy();

        // gone: the next open creates a fresh segment with a new id
        let mut c = SysvSegment::open_or_create(&key, 512).unwrap();
        assert_eq!(c.attachments().unwrap(), 1);
        c.detach_or_destroy();
    }

    #[test]
    fn stale_segment_with_locked_semaphore_is_healed() {
        let key = key("sysv_stale");
        let mut a = SysvSegment::open_or_create(&key, 512).unwrap();
        a.lock().unwrap();
        // detach while holding the lock; this process stays alive so no undo runs
        let sem_id = a.sem_id;
        a.detach_without_cleanup();
        assert_eq!(sem_value(sem_id, "test").unwrap(), 0);

        let mut b = SysvSegment::open_or_create(&key, 1024).unwrap();
        assert_eq!(sem_value(b.sem_id, "test").unwrap(), SEM_UNLOCKED);
        b.lock().unwrap();
        b.unlock().unwrap();
        b.detach_or_destroy();
    }
}
