//! Process-state registry on top of a shared segment
//!
//! - [`ProcessRegistry`]: owns the segment and the psd/param block pools
//! - [`ProcessHandle`]: one process' descriptor and its parameter chain
//! - [`UsageSummary`]: capacity diagnostics
//! - [`value`]: typed parameter codec

pub mod handle;
pub mod layout;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod summary;
pub mod value;

pub use handle::ProcessHandle;
pub use layout::{Layout, MAX_PARAM_LENGTH, MAX_PARAM_NAME, MAX_PROCESS_NAME, NO_OFFSET};
pub use registry::{ProcessInfo, ProcessRegistry, RegistryBuilder};
pub use summary::{ProcessUsage, UsageSummary};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the Unix epoch
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn ms_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

/// Age of a millisecond timestamp, zero if it lies in the future
pub(crate) fn age_of(ms: i64) -> Duration {
    Duration::from_millis((now_ms() - ms).max(0) as u64)
}
