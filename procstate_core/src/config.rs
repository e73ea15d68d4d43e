//! Process-state configuration
//!
//! Typed settings consumed by the registry. Values can come from defaults, a
//! YAML file, or `PROCSTATE_*` environment variables.
//!
//! # Example processstate.yaml
//!
//! ```yaml
//! shm_size: 2048000
//! max_psd_blocks: 100
//! psd_timeout_secs: 120
//! application_name: tower
//! ```

use crate::error::{ProcStateError, ProcStateResult};
use crate::registry::layout::{ControlBlock, ParamBlock, PsdBlock};
use serde::{Deserialize, Serialize};
use std::mem;
use std::path::Path;
use std::time::Duration;

/// Default payload size of the registry segment (2000 KiB)
pub const DEFAULT_SHM_SIZE: usize = 2000 * 1024;
/// Default number of process descriptor blocks
pub const DEFAULT_MAX_PSD_BLOCKS: usize = 100;
/// Default heartbeat timeout in seconds
pub const DEFAULT_PSD_TIMEOUT_SECS: u64 = 120;
/// Valid range for `max_psd_blocks`
pub const PSD_BLOCKS_RANGE: std::ops::RangeInclusive<usize> = 5..=1000;

/// Segment id used by the registry when none is given
pub const DEFAULT_SEGMENT_ID: &str = "processstate";

const ENV_SHM_SIZE: &str = "PROCSTATE_SHM_SIZE";
const ENV_MAX_PSD_BLOCKS: &str = "PROCSTATE_MAX_PSD_BLOCKS";
const ENV_PSD_TIMEOUT: &str = "PROCSTATE_PSD_TIMEOUT";
const ENV_APP_NAME: &str = "PROCSTATE_APP_NAME";

/// Settings for the shared process-state registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessStateConfig {
    /// Payload size of the shared memory segment in bytes
    #[serde(alias = "SHMSize")]
    pub shm_size: usize,

    /// Number of process descriptor blocks (5..=1000)
    #[serde(alias = "PSDBlocks")]
    pub max_psd_blocks: usize,

    /// Heartbeat age in seconds after which a process counts as timed out (0 disables)
    #[serde(alias = "Timeout", alias = "psd_timeout")]
    pub psd_timeout_secs: u64,

    /// Application component of the segment key; defaults to the executable name
    pub application_name: Option<String>,
}

impl Default for ProcessStateConfig {
    fn default() -> Self {
        Self {
            shm_size: DEFAULT_SHM_SIZE,
            max_psd_blocks: DEFAULT_MAX_PSD_BLOCKS,
            psd_timeout_secs: DEFAULT_PSD_TIMEOUT_SECS,
            application_name: None,
        }
    }
}

impl ProcessStateConfig {
    /// Parse a YAML document. Missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> ProcStateResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> ProcStateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcStateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `PROCSTATE_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> ProcStateResult<Self> {
        if let Ok(v) = std::env::var(ENV_SHM_SIZE) {
            self.shm_size = v.trim().parse()?;
        }
        if let Ok(v) = std::env::var(ENV_MAX_PSD_BLOCKS) {
            self.max_psd_blocks = v.trim().parse()?;
        }
        if let Ok(v) = std::env::var(ENV_PSD_TIMEOUT) {
            self.psd_timeout_secs = v.trim().parse()?;
        }
        if let Ok(v) = std::env::var(ENV_APP_NAME) {
            if !v.trim().is_empty() {
                self.application_name = Some(v.trim().to_string());
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Check ranges and that the psd array leaves room for parameter blocks.
    pub fn validate(&self) -> ProcStateResult<()> {
        if !PSD_BLOCKS_RANGE.contains(&self.max_psd_blocks) {
            return Err(ProcStateError::Config(format!(
                "max_psd_blocks {} outside of {}..={}",
                self.max_psd_blocks,
                PSD_BLOCKS_RANGE.start(),
                PSD_BLOCKS_RANGE.end()
            )));
        }

        let fixed = mem::size_of::<ControlBlock>() + self.max_psd_blocks * mem::size_of::<PsdBlock>();
        if self.shm_size < fixed + mem::size_of::<ParamBlock>() {
            return Err(ProcStateError::Config(format!(
                "shm_size {} too small for {} psd blocks (need more than {} bytes)",
                self.shm_size, self.max_psd_blocks, fixed
            )));
        }

        if i32::try_from(self.shm_size).is_err() {
            return Err(ProcStateError::Config(format!(
                "shm_size {} exceeds the 32-bit segment header",
                self.shm_size
            )));
        }

        if let Some(name) = &self.application_name {
            if name.is_empty() || name.contains(['/', '\\', '\0']) {
                return Err(ProcStateError::Config(format!(
                    "invalid application name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Heartbeat timeout, `None` when disabled.
    pub fn psd_timeout(&self) -> Option<Duration> {
        (self.psd_timeout_secs > 0).then(|| Duration::from_secs(self.psd_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProcessStateConfig::default();
        assert_eq!(config.shm_size, 2_048_000);
        assert_eq!(config.max_psd_blocks, 100);
        assert_eq!(config.psd_timeout(), Some(Duration::from_secs(120)));
        config.validate().unwrap();
    }

    #[test]
    fn yaml_partial_keeps_defaults() {
        let config = ProcessStateConfig::from_yaml_str("max_psd_blocks: 20\n").unwrap();
        assert_eq!(config.max_psd_blocks, 20);
        assert_eq!(config.shm_size, DEFAULT_SHM_SIZE);
        assert_eq!(config.psd_timeout_secs, DEFAULT_PSD_TIMEOUT_SECS);
    }

    #[test]
    fn yaml_accepts_legacy_names() {
        let config =
            ProcessStateConfig::from_yaml_str("SHMSize: 100000\nPSDBlocks: 10\nTimeout: 0\n")
                .unwrap();
        assert_eq!(config.shm_size, 100_000);
        assert_eq!(config.max_psd_blocks, 10);
        assert_eq!(config.psd_timeout(), None);
    }

    #[test]
    fn psd_block_range_enforced() {
        let mut config = ProcessStateConfig::default();
        config.max_psd_blocks = 4;
        assert!(matches!(config.validate(), Err(ProcStateError::Config(_))));
        config.max_psd_blocks = 1001;
        assert!(matches!(config.validate(), Err(ProcStateError::Config(_))));
    }

    #[test]
    fn too_small_segment_rejected() {
        let config = ProcessStateConfig {
            shm_size: 1024,
            max_psd_blocks: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processstate.yaml");
        std::fs::write(&path, "psd_timeout_secs: 30\napplication_name: tower\n").unwrap();
        let config = ProcessStateConfig::load(&path).unwrap();
        assert_eq!(config.psd_timeout_secs, 30);
        assert_eq!(config.application_name.as_deref(), Some("tower"));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ProcessStateConfig::load("/nonexistent/processstate.yaml").unwrap_err();
        assert!(matches!(err, ProcStateError::Config(_)));
    }
}
