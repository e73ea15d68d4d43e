//! `procstate params <process>`

use super::Target;
use crate::cli_output;
use procstate_core::ProcStateResult;

pub fn run_params(target: &Target, process: &str) -> ProcStateResult<()> {
    let registry = target.open(true)?;
    let handle = registry.handle_for(process)?;
    let names = handle.list_parameters()?;

    if names.is_empty() {
        cli_output::empty(&format!("'{}' has no parameters", process), None);
        return Ok(());
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
