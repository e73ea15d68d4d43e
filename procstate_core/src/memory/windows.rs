// Windows backend: named file mapping guarded by a named mutex
//
// Named kernel objects disappear with their last handle, so there are no
// stale segments to heal. The mutex doubles as the open/create serializer and
// is released by the OS (WAIT_ABANDONED) when its owner dies.

use crate::error::{ProcStateError, ProcStateResult};
use crate::memory::platform::SegmentKey;
use crate::memory::segment::{init_header, SegmentBackend, SegmentHeader, SEGMENT_HEADER_SIZE};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, ReleaseMutex, WaitForSingleObject, INFINITE,
};

#[derive(Debug)]
pub(crate) struct WinSegment {
    name: String,
    mapping: HANDLE,
    mutex: HANDLE,
    addr: *mut u8,
}

// SAFETY: handles and the mapped view are process-wide; access is serialized by the mutex
unsafe impl Send for WinSegment {}
unsafe impl Sync for WinSegment {}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn win_err(op: &'static str, name: &str) -> ProcStateError {
    // SAFETY: GetLastError is always safe to call after a Windows API failure
    let code = unsafe { GetLastError() };
    let err = ProcStateError::Os {
        op,
        source: std::io::Error::from_raw_os_error(code as i32),
    };
    log::error!("({}) {}", name, err);
    err
}

/// Bounded wait for the mutex while opening, in milliseconds
const OPEN_TIMEOUT_MS: u32 = 500;

fn wait_mutex(mutex: HANDLE, name: &str, timeout_ms: u32) -> ProcStateResult<()> {
    // SAFETY: mutex is a valid handle from CreateMutexW
    let rc = unsafe { WaitForSingleObject(mutex, timeout_ms) };
    match rc {
        WAIT_OBJECT_0 => Ok(()),
        WAIT_TIMEOUT => {
            log::error!("({}) mutex not acquired within {} ms", name, timeout_ms);
            Err(ProcStateError::LockTimeout(name.to_string()))
        }
        WAIT_ABANDONED => {
            log::warn!("({}) previous mutex owner terminated while holding it", name);
            Ok(())
        }
        _ => Err(win_err("WaitForSingleObject", name)),
    }
}

fn release_mutex(mutex: HANDLE, name: &str) -> ProcStateResult<()> {
    // SAFETY: mutex is a valid handle owned by the calling thread
    if unsafe { ReleaseMutex(mutex) } == 0 {
        return Err(win_err("ReleaseMutex", name));
    }
    Ok(())
}

impl WinSegment {
    fn map_or_create(&mut self, key: &SegmentKey, net_size: usize) -> ProcStateResult<()> {
        let total = net_size + SEGMENT_HEADER_SIZE;
        let mapping_name = wide(&key.mapping_name());

        // SAFETY: mapping_name is a valid NUL-terminated wide string
        let mut mapping = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, mapping_name.as_ptr()) };
        let created = mapping == 0;
        if created {
            // SAFETY: INVALID_HANDLE_VALUE creates a pagefile-backed mapping of `total` bytes
            mapping = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    std::ptr::null(),
                    PAGE_READWRITE,
                    (total as u64 >> 32) as u32,
                    total as u32,
                    mapping_name.as_ptr(),
                )
            };
            if mapping == 0 {
                return Err(win_err("CreateFileMappingW", &self.name));
            }
        }
        self.mapping = mapping;

        // SAFETY: mapping is a valid file mapping handle; length 0 maps the whole object
        let ptr = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if ptr.is_null() {
            return Err(win_err("MapViewOfFile", &self.name));
        }
        self.addr = ptr as *mut u8;

        if created {
            // SAFETY: fresh mapping of `total` bytes, creation serialized by the mutex
            unsafe { init_header(self.addr, net_size) };
            log::debug!("({}) created new segment of size {}", self.name, net_size);
            return Ok(());
        }

        // SAFETY: an existing mapping always carries a header written by its creator
        let header = unsafe { std::ptr::read_volatile(self.addr as *const SegmentHeader) };
        if header.net_size as usize != net_size {
            log::error!(
                "({}) existing segment has size {} but {} was requested, configuration problem?",
                self.name,
                header.net_size,
                net_size
            );
            return Err(ProcStateError::Config(format!(
                "segment {} exists with size {} bytes, requested {} bytes",
                self.name, header.net_size, net_size
            )));
        }
        log::debug!("({}) found existing segment of size {}", self.name, net_size);
        Ok(())
    }

    fn close(&mut self) {
        if !self.addr.is_null() {
            // SAFETY: addr is a mapped view from MapViewOfFile
            unsafe { UnmapViewOfFile(self.addr as *const std::ffi::c_void) };
            self.addr = std::ptr::null_mut();
        }
        if self.mapping != 0 {
            // SAFETY: mapping is a valid handle
            unsafe { CloseHandle(self.mapping) };
            self.mapping = 0;
        }
        if self.mutex != 0 {
            // SAFETY: mutex is a valid handle
            unsafe { CloseHandle(self.mutex) };
            self.mutex = 0;
        }
    }
}

impl SegmentBackend for WinSegment {
    fn open_or_create(key: &SegmentKey, net_size: usize) -> ProcStateResult<Self> {
        let name = key.to_string();
        let mutex_name = wide(&key.mutex_name());

        // SAFETY: mutex_name is a valid NUL-terminated wide string
        let mutex = unsafe { CreateMutexW(std::ptr::null(), 0, mutex_name.as_ptr()) };
        if mutex == 0 {
            return Err(win_err("CreateMutexW", &name));
        }

        let mut segment = Self {
            name,
            mapping: 0,
            mutex,
            addr: std::ptr::null_mut(),
        };

        if let Err(e) = wait_mutex(mutex, &segment.name, OPEN_TIMEOUT_MS) {
            segment.close();
            return Err(e);
        }
        let result = segment.map_or_create(key, net_size);
        let released = release_mutex(mutex, &segment.name);

        match result.and(released) {
            Ok(()) => Ok(segment),
            Err(e) => {
                segment.close();
                Err(e)
            }
        }
    }

    fn base(&self) -> *mut u8 {
        self.addr
    }

    fn lock(&self) -> ProcStateResult<()> {
        wait_mutex(self.mutex, &self.name, INFINITE)
    }

    fn unlock(&self) -> ProcStateResult<()> {
        release_mutex(self.mutex, &self.name)
    }

    fn attachments(&self) -> ProcStateResult<usize> {
        Err(ProcStateError::Os {
            op: "attachment count",
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }

    fn detach_or_destroy(&mut self) {
        self.close();
    }

    fn detach_without_cleanup(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ProcStateError;
    use crate::memory::SharedSegment;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn open_gives_up_while_lock_is_held() {
        let app = format!("win_open_{}", std::process::id());
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        // the mutex is owned per thread, so the holder needs its own thread
        let holder = {
            let app = app.clone();
            std::thread::spawn(move || {
                let seg = SharedSegment::open_or_create("unit", 1024, Some(&app)).unwrap();
                let _guard = seg.locked().unwrap();
                locked_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let started = Instant::now();
        let err = SharedSegment::open_or_create("unit", 1024, Some(&app)).unwrap_err();
        assert!(matches!(err, ProcStateError::LockTimeout(_)), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
