//! Capacity diagnostics for registration and parameter-pool triage

use super::registry::RegistryGuard;
use super::{age_of, now_ms};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Fewer spare psd blocks than this triggers a warning
pub const MIN_SPARE_PSD: usize = 5;
/// Fewer spare param blocks than this triggers a warning
pub const MIN_SPARE_PARAMS: usize = 20;

/// Per-process line of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub name: String,
    pub pid: i32,
    /// Blocks in the chain, including unexpected unused ones
    pub param_count: usize,
    /// Chained blocks not marked used (expected to be 0)
    pub unused_param_count: usize,
    pub timed_out: bool,
    /// Minutes since registration
    pub age_minutes: u64,
    /// Set when the chain could not be walked
    pub chain_error: Option<String>,
}

/// Used/free counts of the psd and param pools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    /// Payload size in bytes
    pub total_size: usize,
    pub used_psd: usize,
    pub max_psd: usize,
    /// Parameters reachable from process chains
    pub used_param: usize,
    pub max_param: usize,
    /// Parameter blocks marked used across the whole pool
    pub pool_param: usize,
    pub processes: Vec<ProcessUsage>,
    /// Render only the totals
    #[serde(skip)]
    pub short: bool,
}

impl UsageSummary {
    pub(crate) fn collect(guard: &RegistryGuard<'_>, psd_timeout: Option<Duration>, short: bool) -> Self {
        let layout = guard.layout();
        let now = now_ms();
        let mut summary = UsageSummary {
            total_size: guard.segment_size(),
            max_psd: layout.max_psd_blocks,
            max_param: layout.max_param_blocks,
            short,
            ..Default::default()
        };

        for psd in guard.psds().filter(|p| p.used()) {
            let mut usage = ProcessUsage {
                name: psd.name(),
                pid: psd.pid(),
                param_count: 0,
                unused_param_count: 0,
                timed_out: psd_timeout.is_some_and(|t| age_of(psd.heartbeat_ms()) > t),
                age_minutes: ((now - psd.start_time_ms()).max(0) as u64 + 30_000) / 60_000,
                chain_error: None,
            };
            match guard.chain(psd) {
                Ok(chain) => {
                    usage.param_count = chain.len();
                    usage.unused_param_count = chain.iter().filter(|p| !p.used()).count();
                }
                Err(e) => usage.chain_error = Some(e.to_string()),
            }
            summary.used_param += usage.param_count;
            summary.processes.push(usage);
        }
        summary.used_psd = summary.processes.len();
        summary.processes.sort_by(|a, b| a.name.cmp(&b.name));

        summary.pool_param = guard.params().filter(|p| p.used()).count();
        summary
    }

    pub fn free_psd(&self) -> usize {
        self.max_psd.saturating_sub(self.used_psd)
    }

    pub fn free_param(&self) -> usize {
        self.max_param.saturating_sub(self.used_param)
    }

    /// Chained and pool-wide parameter counts agree
    pub fn is_plausible(&self) -> bool {
        self.used_param == self.pool_param
            && self
                .processes
                .iter()
                .all(|p| p.unused_param_count == 0 && p.chain_error.is_none())
    }

    /// Low-capacity conditions worth logging
    pub fn capacity_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.used_psd + MIN_SPARE_PSD > self.max_psd {
            warnings.push(format!(
                "less than {} free psd blocks remaining ({}/{} used)",
                MIN_SPARE_PSD, self.used_psd, self.max_psd
            ));
        }
        if self.used_param + MIN_SPARE_PARAMS > self.max_param {
            warnings.push(format!(
                "less than {} parameter blocks remaining ({}/{} used)",
                MIN_SPARE_PARAMS, self.used_param, self.max_param
            ));
        }
        warnings
    }
}

impl fmt::Display for UsageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total SHM size: {} kb", self.total_size >> 10)?;
        writeln!(f, "Process count: {}/{}", self.used_psd, self.max_psd)?;
        writeln!(f, "Parameter count: {}/{}", self.used_param, self.max_param)?;
        if self.short {
            return Ok(());
        }

        for p in &self.processes {
            writeln!(
                f,
                "{:>20}: params: {:>3}; timed out: {}; age: {} minutes",
                p.name, p.param_count, p.timed_out, p.age_minutes
            )?;
            if p.unused_param_count != 0 {
                writeln!(
                    f,
                    "ERROR: process has {} unused params in its linked list",
                    p.unused_param_count
                )?;
            }
            if let Some(err) = &p.chain_error {
                writeln!(f, "ERROR: {}", err)?;
            }
        }

        if self.used_param != self.pool_param {
            writeln!(
                f,
                "ERROR: param count mismatch {} vs {}",
                self.used_param, self.pool_param
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UsageSummary {
        UsageSummary {
            total_size: 64 * 1024,
            used_psd: 2,
            max_psd: 10,
            used_param: 3,
            max_param: 100,
            pool_param: 3,
            processes: vec![
                ProcessUsage {
                    name: "fdp".into(),
                    pid: 10,
                    param_count: 2,
                    unused_param_count: 0,
                    timed_out: false,
                    age_minutes: 3,
                    chain_error: None,
                },
                ProcessUsage {
                    name: "radar".into(),
                    pid: 11,
                    param_count: 1,
                    unused_param_count: 0,
                    timed_out: true,
                    age_minutes: 0,
                    chain_error: None,
                },
            ],
            short: false,
        }
    }

    #[test]
    fn short_render_has_totals_only() {
        let summary = UsageSummary {
            short: true,
            ..sample()
        };
        let text = summary.to_string();
        assert_eq!(
            text,
            "Total SHM size: 64 kb\nProcess count: 2/10\nParameter count: 3/100\n"
        );
    }

    #[test]
    fn full_render_lists_processes() {
        let text = sample().to_string();
        assert!(text.contains(&format!(
            "{:>20}: params:   2; timed out: false; age: 3 minutes",
            "fdp"
        )));
        assert!(text.contains("radar: params:   1; timed out: true"));
        assert!(!text.contains("ERROR"));
        assert!(sample().is_plausible());
    }

    #[test]
    fn mismatch_reported() {
        let mut summary = sample();
        summary.pool_param = 5;
        assert!(!summary.is_plausible());
        assert!(summary
            .to_string()
            .contains("ERROR: param count mismatch 3 vs 5"));
    }

    #[test]
    fn capacity_thresholds() {
        let mut summary = sample();
        assert!(summary.capacity_warnings().is_empty());
        summary.used_psd = 6;
        summary.used_param = 81;
        let warnings = summary.capacity_warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("psd"));
        assert_eq!(summary.free_psd(), 4);
        assert_eq!(summary.free_param(), 19);
    }
}
