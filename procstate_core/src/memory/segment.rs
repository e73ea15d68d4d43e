//! Cross-process shared segment with a process-external lock
//!
//! A [`SharedSegment`] is an OS-backed byte region of `header + size` bytes
//! identified by a [`SegmentKey`]. The first attacher of an unused key
//! creates it; the last one to detach destroys it together with its lock
//! primitive. Segments whose attachers all died are detected as stale on the
//! next open and recreated.
//!
//! Layout:
//! ```text
//! +-------------------------+------------------------------+
//! | SegmentHeader (8 bytes) | payload (size bytes)         |
//! | net_size | initialized  |                              |
//! +-------------------------+------------------------------+
//! ```

use crate::error::{ProcStateError, ProcStateResult};
use crate::memory::platform::SegmentKey;
use crate::memory::PlatformBackend;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::ThreadId;

/// Header preceding the payload of every segment
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SegmentHeader {
    /// Payload size in bytes, header excluded
    pub net_size: i32,
    /// Non-zero once a higher layer has laid out its records
    pub initialized: i32,
}

/// Size of [`SegmentHeader`]
pub const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

const _: () = assert!(SEGMENT_HEADER_SIZE == 8);

/// Operations every OS backend provides.
///
/// `open_or_create` runs the whole create/attach/heal algorithm under the
/// platform's cross-process serialization and leaves a written header behind
/// when it created the segment.
pub(crate) trait SegmentBackend: Sized + Send + Sync {
    fn open_or_create(key: &SegmentKey, net_size: usize) -> ProcStateResult<Self>;

    /// Start of the mapping (header included)
    fn base(&self) -> *mut u8;

    /// Block until the segment lock is held by this process
    fn lock(&self) -> ProcStateResult<()>;

    fn unlock(&self) -> ProcStateResult<()>;

    /// Number of processes currently attached
    fn attachments(&self) -> ProcStateResult<usize>;

    /// Detach and destroy the segment and its lock when no one else is attached
    fn detach_or_destroy(&mut self);

    /// Detach leaving the segment behind, as a crashed process would
    fn detach_without_cleanup(&mut self);
}

/// Write a fresh header into a newly created mapping.
///
/// # Safety
/// `base` must point to a writable mapping of at least
/// `SEGMENT_HEADER_SIZE + net_size` bytes that no other process uses yet.
pub(crate) unsafe fn init_header(base: *mut u8, net_size: usize) {
    std::ptr::write_bytes(base, 0, SEGMENT_HEADER_SIZE + net_size);
    let header = SegmentHeader {
        net_size: net_size as i32,
        initialized: 0,
    };
    std::ptr::write_unaligned(base as *mut SegmentHeader, header);
}

/// Shared segment attached by this process
///
/// The lock is non-recursive and owned by the locking thread. Dropping the
/// segment releases a lock still held, detaches, and destroys the segment if
/// this was the last attachment.
pub struct SharedSegment {
    key: SegmentKey,
    size: usize,
    backend: PlatformBackend,
    lock_owner: Mutex<Option<ThreadId>>,
}

impl SharedSegment {
    /// Attach to the segment `segment_id` of `size` payload bytes, creating it if needed.
    ///
    /// Fails with [`ProcStateError::Config`] when a live segment with a
    /// different size already exists under the same key.
    pub fn open_or_create(
        segment_id: &str,
        size: usize,
        app_name: Option<&str>,
    ) -> ProcStateResult<Self> {
        let key = SegmentKey::derive(segment_id, app_name)?;
        Self::open_with_key(key, size)
    }

    /// Attach using an already derived key.
    pub fn open_with_key(key: SegmentKey, size: usize) -> ProcStateResult<Self> {
        let total = size.checked_add(SEGMENT_HEADER_SIZE);
        if size == 0 || total.map_or(true, |t| i32::try_from(t).is_err()) {
            return Err(ProcStateError::InvalidInput(format!(
                "segment size {} out of range",
                size
            )));
        }

        log::debug!("opening segment {} ({} bytes)", key, size);
        let backend = PlatformBackend::open_or_create(&key, size)?;

        Ok(Self {
            key,
            size,
            backend,
            lock_owner: Mutex::new(None),
        })
    }

    /// Block until this thread holds the segment lock.
    ///
    /// Locking twice from the same thread is refused instead of deadlocking.
    pub fn lock(&self) -> ProcStateResult<()> {
        let me = std::thread::current().id();
        if *self.lock_owner.lock() == Some(me) {
            log::error!("({}) recursive lock attempt", self.key);
            return Err(ProcStateError::InvalidInput(format!(
                "segment {} is already locked by this thread",
                self.key
            )));
        }

        self.backend.lock()?;
        *self.lock_owner.lock() = Some(me);
        Ok(())
    }

    /// Release the lock taken by [`lock`](Self::lock) on this thread.
    pub fn unlock(&self) -> ProcStateResult<()> {
        let me = std::thread::current().id();
        {
            let mut owner = self.lock_owner.lock();
            if *owner != Some(me) {
                log::error!("({}) tried to unlock, but this thread did not lock", self.key);
                return Err(ProcStateError::InvalidInput(format!(
                    "segment {} is not locked by this thread",
                    self.key
                )));
            }
            // cleared before the release so the owner slot is still serialized
            *owner = None;
        }
        self.backend.unlock()
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn locked(&self) -> ProcStateResult<SegmentGuard<'_>> {
        self.lock()?;
        Ok(SegmentGuard { segment: self })
    }

    /// Whether the calling thread currently holds the lock
    pub fn is_locked_by_current_thread(&self) -> bool {
        *self.lock_owner.lock() == Some(std::thread::current().id())
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn key(&self) -> &SegmentKey {
        &self.key
    }

    /// Start of the payload, valid for `size()` bytes while the segment is attached
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping spans header + size bytes
        unsafe { self.backend.base().add(SEGMENT_HEADER_SIZE) }
    }

    fn initialized_flag(&self) -> &AtomicI32 {
        // SAFETY: the header lives at the 8-aligned (page-aligned) start of the
        // mapping, which stays attached for the lifetime of &self
        unsafe {
            let header = self.backend.base() as *mut SegmentHeader;
            AtomicI32::from_ptr(std::ptr::addr_of_mut!((*header).initialized))
        }
    }

    /// Whether a higher layer has laid out its records
    pub fn is_initialized(&self) -> bool {
        self.initialized_flag().load(Ordering::Acquire) != 0
    }

    /// Mark the payload as laid out. Call while holding the lock.
    pub fn set_initialized(&self) {
        self.initialized_flag().store(1, Ordering::Release);
    }

    /// Payload size recorded in the shared header by the creator
    pub fn header_size_field(&self) -> usize {
        // SAFETY: see initialized_flag
        let header = unsafe { std::ptr::read_volatile(self.backend.base() as *const SegmentHeader) };
        header.net_size.max(0) as usize
    }

    /// Number of processes currently attached
    pub fn attachments(&self) -> ProcStateResult<usize> {
        self.backend.attachments()
    }

    /// Detach without destroying, leaving a stale segment for the next opener.
    pub fn detach_without_cleanup(mut self) {
        self.release_if_locked();
        self.backend.detach_without_cleanup();
    }

    fn release_if_locked(&mut self) {
        let owner = self.lock_owner.get_mut().take();
        if owner.is_some() {
            log::error!("({}) segment is still locked while detaching", self.key);
            if let Err(e) = self.backend.unlock() {
                log::error!("({}) could not release lock: {}", self.key, e);
            }
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.release_if_locked();
        self.backend.detach_or_destroy();
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}

/// RAII hold on the segment lock
pub struct SegmentGuard<'a> {
    segment: &'a SharedSegment,
}

impl<'a> SegmentGuard<'a> {
    pub fn segment(&self) -> &'a SharedSegment {
        self.segment
    }

    /// Start of the payload
    pub fn as_ptr(&self) -> *mut u8 {
        self.segment.as_ptr()
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the payload is size() bytes and other writers are excluded by the lock
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr(), self.segment.size()) }
    }

    /// Mutable payload bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in data(); &mut self prevents aliasing through this guard
        unsafe { std::slice::from_raw_parts_mut(self.segment.as_ptr(), self.segment.size()) }
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.segment.unlock() {
            log::error!("({}) unlock on guard drop failed: {}", self.segment.key(), e);
        }
    }
}
