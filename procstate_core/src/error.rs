//! Unified error handling for the process-state registry
//!
//! Every fallible operation in this crate returns [`ProcStateResult`]. The
//! variants follow the registry's failure taxonomy: configuration mistakes,
//! exhausted slot pools, integrity violations and OS-level failures of the
//! shared-memory backend. A missing parameter is not an error; lookups return
//! `Ok(None)` for that case.

use std::fmt;

use thiserror::Error;

/// Fixed-size pool that ran out of free entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Process descriptor (psd) blocks.
    ProcessSlot,
    /// Parameter blocks.
    ParameterSlot,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::ProcessSlot => write!(f, "process descriptor block"),
            Resource::ParameterSlot => write!(f, "parameter block"),
        }
    }
}

/// Main error type for process-state operations
#[derive(Debug, Error)]
pub enum ProcStateError {
    /// I/O related errors (lock files, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors, including segment size mismatches between attachers
    #[error("Configuration error: {0}")]
    Config(String),

    /// A parameter value does not fit into one parameter block
    #[error("Parameter '{key}' value is {len} bytes, exceeds the limit of {max} bytes")]
    ValueTooLarge { key: String, len: usize, max: usize },

    /// No free block left in one of the fixed-size pools
    #[error("No free {resource} left: {detail}")]
    CapacityExhausted { resource: Resource, detail: String },

    /// The named process has no registry entry
    #[error("Process not found: {0}")]
    NotFound(String),

    /// Shared memory contents violate a structural invariant
    #[error("Shared memory corrupted: {0}")]
    Corrupted(String),

    /// System call failure in the shared-memory or locking backend
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The advisory lock file could not be acquired within the bounded wait
    #[error("Timed out acquiring lock file {0}")]
    LockTimeout(String),

    /// Mutation attempted through a read-only registry
    #[error("Registry is read-only: {0}")]
    ReadOnly(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Value codec errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors with source location for debugging.
    /// Use the `procstate_internal!()` macro to create these.
    #[error("Internal error: {message} (at {file}:{line})")]
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },
}

/// Create an internal error with automatic file/line capture.
///
/// ```rust,ignore
/// return Err(procstate_internal!("unexpected offset {}", offset));
/// ```
#[macro_export]
macro_rules! procstate_internal {
    ($($arg:tt)*) => {
        $crate::error::ProcStateError::Internal {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

impl ProcStateError {
    /// Build an [`ProcStateError::Os`] from the calling thread's last OS error.
    pub fn last_os(op: &'static str) -> Self {
        ProcStateError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Whether continuing after this error risks silent corruption or an
    /// unsupervised process.
    ///
    /// The library never terminates the process itself; entry points are
    /// expected to exit when this returns `true`.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcStateError::Config(_)
            | ProcStateError::ValueTooLarge { .. }
            | ProcStateError::Corrupted(_) => true,
            ProcStateError::CapacityExhausted { resource, .. } => {
                *resource == Resource::ProcessSlot
            }
            _ => false,
        }
    }
}

/// Convenience type alias for Results using ProcStateError
pub type ProcStateResult<T> = std::result::Result<T, ProcStateError>;

/// Short alias: `Result<T>` is equivalent to `ProcStateResult<T>`
pub type Result<T> = ProcStateResult<T>;

impl From<bincode::Error> for ProcStateError {
    fn from(err: bincode::Error) -> Self {
        ProcStateError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProcStateError {
    fn from(err: serde_yaml::Error) -> Self {
        ProcStateError::Config(format!("YAML error: {}", err))
    }
}

impl From<std::num::ParseIntError> for ProcStateError {
    fn from(err: std::num::ParseIntError) -> Self {
        ProcStateError::Config(format!("Integer parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ProcStateError::Config("size mismatch".into()).is_fatal());
        assert!(ProcStateError::ValueTooLarge {
            key: "k".into(),
            len: 201,
            max: 200
        }
        .is_fatal());
        assert!(ProcStateError::CapacityExhausted {
            resource: Resource::ProcessSlot,
            detail: String::new(),
        }
        .is_fatal());
        assert!(!ProcStateError::CapacityExhausted {
            resource: Resource::ParameterSlot,
            detail: String::new(),
        }
        .is_fatal());
        assert!(!ProcStateError::NotFound("a".into()).is_fatal());
    }

    #[test]
    fn internal_macro_captures_location() {
        let err = procstate_internal!("bad offset {}", 42);
        match err {
            ProcStateError::Internal { message, file, line } => {
                assert_eq!(message, "bad offset 42");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn display_messages() {
        let err = ProcStateError::ValueTooLarge {
            key: "status".into(),
            len: 300,
            max: 200,
        };
        assert_eq!(
            err.to_string(),
            "Parameter 'status' value is 300 bytes, exceeds the limit of 200 bytes"
        );
    }
}
