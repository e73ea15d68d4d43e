//! Segment key derivation
//!
//! Two processes share a segment iff they agree on the lowercased OS user,
//! the lowercased application name and the segment id. The triple maps to a
//! lock file in the temp directory (unix: also the `ftok` source) and to the
//! names of the Windows mapping/mutex objects.

use crate::error::{ProcStateError, ProcStateResult};
use std::path::{Path, PathBuf};

/// Prefix of lock files and Windows object names
const KEY_PREFIX: &str = "shm";

/// Fallback when the executable name cannot be determined
const FALLBACK_APP_NAME: &str = "procstate";

/// Identity of one shared segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    user: String,
    app: String,
    segment_id: String,
    lock_file: PathBuf,
}

impl SegmentKey {
    /// Derive the key for `segment_id`, using the executable name when `app_name` is `None`.
    pub fn derive(segment_id: &str, app_name: Option<&str>) -> ProcStateResult<Self> {
        let app = match app_name {
            Some(name) => name.to_string(),
            None => default_app_name(),
        };
        Self::with_user(&current_user(), &app, segment_id)
    }

    /// Derive a key for an explicit user.
    pub fn with_user(user: &str, app: &str, segment_id: &str) -> ProcStateResult<Self> {
        validate_component("segment id", segment_id)?;
        validate_component("application name", app)?;
        validate_component("user name", user)?;

        let user = user.to_lowercase();
        let app = app.to_lowercase();
        let lock_file = std::env::temp_dir().join(format!(
            "{}_{}_{}_{}",
            KEY_PREFIX, user, app, segment_id
        ));

        Ok(Self {
            user,
            app,
            segment_id: segment_id.to_string(),
            lock_file,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    /// Advisory lock file serializing open/create across processes
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Session-local name of the Windows file mapping
    pub fn mapping_name(&self) -> String {
        format!(
            "Local\\{}_{}_{}_{}",
            KEY_PREFIX, self.user, self.app, self.segment_id
        )
    }

    /// Session-local name of the Windows mutex guarding the mapping
    pub fn mutex_name(&self) -> String {
        format!("{}_mutex", self.mapping_name())
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user, self.app, self.segment_id)
    }
}

fn validate_component(what: &str, value: &str) -> ProcStateResult<()> {
    if value.is_empty() {
        return Err(ProcStateError::InvalidInput(format!("{} must not be empty", what)));
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(ProcStateError::InvalidInput(format!(
            "{} '{}' contains a path separator or NUL byte",
            what,
            value.escape_debug()
        )));
    }
    Ok(())
}

/// Application name derived from the running executable
pub fn default_app_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_APP_NAME.to_string())
}

/// Name of the effective OS user
#[cfg(unix)]
pub fn current_user() -> String {
    // SAFETY: geteuid has no preconditions
    let uid = unsafe { libc::geteuid() };
    // SAFETY: passwd is a plain C struct, all-zero is a valid bit pattern
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 4096];

    // SAFETY: pwd, buf and result are valid for writes; buf.len() is the buffer size passed
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc == 0 && !result.is_null() && !pwd.pw_name.is_null() {
        // SAFETY: getpwuid_r succeeded, pw_name points into buf and is NUL terminated
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
        let name = name.to_string_lossy();
        if !name.is_empty() {
            return name.into_owned();
        }
    }

    env_user().unwrap_or_else(|| format!("uid{}", uid))
}

/// Name of the current OS user
#[cfg(windows)]
pub fn current_user() -> String {
    env_user().unwrap_or_else(|| "unknown".to_string())
}

fn env_user() -> Option<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
}
