//! `procstate summary` - capacity of the psd and parameter pools

use super::Target;
use crate::cli_output;
use procstate_core::{ProcStateError, ProcStateResult};

pub fn run_summary(target: &Target, short: bool, json: bool) -> ProcStateResult<()> {
    let registry = target.open(true)?;
    let mut summary = registry.usage()?;
    summary.short = short;

    if json {
        let text = serde_json::to_string_pretty(&summary)
            .map_err(|e| ProcStateError::Serialization(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    print!("{}", summary);
    for warning in summary.capacity_warnings() {
        cli_output::warn(&warning);
    }
    if !summary.is_plausible() {
        cli_output::warn("parameter chains and pool disagree, the segment may be corrupted");
    }
    Ok(())
}
