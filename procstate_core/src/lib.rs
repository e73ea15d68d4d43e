//! # procstate core
//!
//! Shared-memory process-state registry. Independent OS processes publish a
//! heartbeat and a set of named parameters into one shared segment, and any
//! process (including one started later, or restarted under the same name)
//! can read, poll and atomically update them.
//!
//! - **Memory**: a cross-process shared segment with an auto-released lock,
//!   stale-segment healing and size checks ([`memory`])
//! - **Registry**: fixed layout of process descriptors and parameter blocks
//!   on top of one segment ([`registry`])
//! - **Poller**: edge-triggered change notifications for one parameter
//!   ([`poller`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use procstate_core::{ProcessRegistry, ProcessStateConfig};
//!
//! # fn main() -> procstate_core::ProcStateResult<()> {
//! let registry = ProcessRegistry::builder()
//!     .config(ProcessStateConfig::default())
//!     .build()?;
//!
//! let me = registry.register_self("fdp", std::process::id() as i32, 0)?;
//! me.set_parameter("mode", b"operational")?;
//!
//! let radar = registry.handle_for("radar")?;
//! if radar.is_valid() {
//!     let mode = radar.get_parameter("mode")?;
//!     println!("radar mode: {:?}", mode);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod poller;
pub mod registry;

pub use config::ProcessStateConfig;
pub use error::{ProcStateError, ProcStateResult, Resource};
pub use memory::{SegmentKey, SharedSegment};
pub use poller::{ChangeDetector, ChangePoller, PollEvent, PollState, PollerConfig};
pub use registry::{
    ProcessHandle, ProcessInfo, ProcessRegistry, ProcessUsage, RegistryBuilder, UsageSummary,
};
