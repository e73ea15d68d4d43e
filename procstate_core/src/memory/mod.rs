// Shared memory segment and its OS backends

#[cfg(unix)]
pub mod file_lock;
pub mod platform;
pub mod segment;

#[cfg(unix)]
mod sysv;
#[cfg(windows)]
mod windows;

pub use platform::SegmentKey;
pub use segment::{SegmentGuard, SegmentHeader, SharedSegment, SEGMENT_HEADER_SIZE};

#[cfg(unix)]
pub(crate) type PlatformBackend = sysv::SysvSegment;
#[cfg(windows)]
pub(crate) type PlatformBackend = windows::WinSegment;
