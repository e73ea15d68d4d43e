//! `procstate list` - registered processes and their liveness

use super::Target;
use crate::cli_output;
use colored::*;
use procstate_core::{ProcStateError, ProcStateResult};

pub fn run_list(target: &Target, json: bool) -> ProcStateResult<()> {
    let registry = target.open(true)?;
    let mut infos = registry.process_infos()?;
    infos.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        let text = serde_json::to_string_pretty(&infos)
            .map_err(|e| ProcStateError::Serialization(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    if infos.is_empty() {
        cli_output::empty(
            "No registered processes",
            Some("check --app/--segment, or start one with `procstate register <name>`"),
        );
        return Ok(());
    }

    cli_output::header(&format!(
        "{:<24} {:>8} {:>7} {:>10}  {:<19}  {}",
        "NAME", "PID", "PARAMS", "HEARTBEAT", "STARTED", "STATUS"
    ));
    for info in &infos {
        let status = if info.timed_out {
            "timed out".red()
        } else {
            "alive".green()
        };
        println!(
            "{:<24} {:>8} {:>7} {:>10}  {:<19}  {}",
            info.name,
            info.pid,
            info.parameter_count,
            cli_output::format_age(info.heartbeat_age()),
            cli_output::format_timestamp(info.start_time_ms),
            status
        );
    }

    match registry.psd_timeout() {
        Some(timeout) => log::debug!("psd timeout: {:?}", timeout),
        None => cli_output::hint("psd timeout disabled, nothing is reported as timed out"),
    }
    Ok(())
}
