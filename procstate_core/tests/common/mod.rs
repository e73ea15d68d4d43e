//! Shared helpers for procstate_core integration tests

#![allow(dead_code)]

use procstate_core::ProcessRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Application name unique to this test process and call, so parallel tests
/// and test binaries never share a segment.
pub fn unique_app(tag: &str) -> String {
    format!(
        "it_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Small registry used by most tests: 8 processes, 32 parameters.
pub fn small_registry(app: &str) -> ProcessRegistry {
    ProcessRegistry::builder()
        .application_name(app)
        .segment_id("itest")
        .shm_size(64 * 1024)
        .max_psd_blocks(8)
        .max_param_blocks(32)
        .build()
        .expect("failed to open test registry")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
