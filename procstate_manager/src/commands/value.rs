//! `procstate get|set|swap` - single parameter access
//!
//! Values are handled as raw bytes of the given string; `get` and `swap`
//! print the stored bytes as text, or hex when they are not printable.

use super::Target;
use crate::cli_output;
use procstate_core::{ProcStateError, ProcStateResult};

pub fn run_get(target: &Target, process: &str, key: &str) -> ProcStateResult<()> {
    let registry = target.open(true)?;
    let handle = registry.handle_for(process)?;
    match handle.get_parameter(key)? {
        Some(value) => {
            println!("{}", cli_output::format_value(&value));
            Ok(())
        }
        None => Err(ProcStateError::InvalidInput(format!(
            "'{}' has no parameter '{}'",
            process, key
        ))),
    }
}

pub fn run_set(target: &Target, process: &str, key: &str, value: &str) -> ProcStateResult<()> {
    let registry = target.open(false)?;
    let handle = registry.handle_for(process)?;
    handle.set_parameter(key, value.as_bytes())?;
    cli_output::success(&format!("{}.{} = {}", process, key, value));
    Ok(())
}

pub fn run_swap(target: &Target, process: &str, key: &str, value: &str) -> ProcStateResult<()> {
    let registry = target.open(false)?;
    let handle = registry.handle_for(process)?;
    match handle.get_and_set_parameter_atomic(key, value.as_bytes())? {
        Some(old) => println!("{}", cli_output::format_value(&old)),
        None => cli_output::hint(&format!("'{}' was not set before", key)),
    }
    Ok(())
}
