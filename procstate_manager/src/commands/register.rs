//! `procstate register <name>` - hold a registry entry with a live heartbeat

use super::Target;
use crate::cli_output;
use procstate_core::{ProcStateError, ProcStateResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(100);

/// Split `KEY=VALUE`.
pub fn parse_param(arg: &str) -> ProcStateResult<(&str, &str)> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ProcStateError::InvalidInput(format!(
            "expected KEY=VALUE, got '{}'",
            arg
        ))),
    }
}

pub fn run_register(
    target: &Target,
    name: &str,
    hold: Option<u64>,
    params: &[String],
    keep: bool,
) -> ProcStateResult<()> {
    let params = params
        .iter()
        .map(|p| parse_param(p))
        .collect::<ProcStateResult<Vec<_>>>()?;

    let registry = target.open(false)?;
    let handle = registry.register_self(name, std::process::id() as i32, 0)?;
    for (key, value) in &params {
        handle.set_parameter(key, value.as_bytes())?;
    }
    cli_output::success(&format!(
        "registered '{}' (pid {}) in slot {}",
        name,
        std::process::id(),
        handle.slot().map_or_else(|| "?".to_string(), |s| s.to_string())
    ));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    match hold {
        Some(secs) => cli_output::info(&format!("holding for {}s (Ctrl+C to stop)", secs)),
        None => cli_output::info("holding until Ctrl+C"),
    }

    let deadline = hold.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_beat = Instant::now();
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(TICK);
        if last_beat.elapsed() >= HEARTBEAT_PERIOD {
            handle.touch()?;
            last_beat = Instant::now();
        }
    }

    if keep {
        drop(handle);
        registry.detach_without_cleanup()?;
        cli_output::info(&format!("leaving '{}' registered", name));
        cli_output::hint("the entry survives only while another process stays attached");
    } else {
        handle.unregister()?;
        cli_output::success(&format!("unregistered '{}'", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs() {
        assert_eq!(parse_param("mode=scan").unwrap(), ("mode", "scan"));
        assert_eq!(parse_param("eq=a=b").unwrap(), ("eq", "a=b"));
        assert_eq!(parse_param("empty=").unwrap(), ("empty", ""));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }
}
