//! `procstate` subcommands
//!
//! Every command attaches to the registry selected by the global options,
//! does its work and detaches again. Inspection commands attach read-only.

pub mod list;
pub mod params;
pub mod register;
pub mod summary;
pub mod value;
pub mod watch;

use procstate_core::{ProcStateResult, ProcessRegistry, ProcessStateConfig};
use std::path::PathBuf;

/// Registry selection from the global options
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub app: Option<String>,
    pub segment: String,
    pub config: Option<PathBuf>,
}

impl Target {
    /// Configuration from `--config` (or defaults), then environment, then `--app`.
    pub fn config(&self) -> ProcStateResult<ProcessStateConfig> {
        let config = match &self.config {
            Some(path) => ProcessStateConfig::load(path)?,
            None => ProcessStateConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(app) = &self.app {
            config.application_name = Some(app.clone());
        }
        Ok(config)
    }

    pub fn open(&self, read_only: bool) -> ProcStateResult<ProcessRegistry> {
        let config = self.config()?;
        log::debug!(
            "attaching to segment '{}' of app {:?} ({} bytes, read_only={})",
            self.segment,
            config.application_name,
            config.shm_size,
            read_only
        );
        ProcessRegistry::builder()
            .segment_id(&self.segment)
            .config(config)
            .read_only(read_only)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn app_flag_overrides_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SHMSize: 65536\nPSDBlocks: 10\napplication_name: fromfile").unwrap();

        let target = Target {
            app: None,
            segment: "processstate".into(),
            config: Some(file.path().to_path_buf()),
        };
        let config = target.config().unwrap();
        assert_eq!(config.max_psd_blocks, 10);
        assert_eq!(config.application_name.as_deref(), Some("fromfile"));

        let target = Target {
            app: Some("fromflag".into()),
            ..target
        };
        assert_eq!(
            target.config().unwrap().application_name.as_deref(),
            Some("fromflag")
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let target = Target {
            config: Some(PathBuf::from("/nonexistent/procstate.yaml")),
            ..Default::default()
        };
        assert!(target.config().is_err());
    }
}
