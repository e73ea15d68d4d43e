//! `procstate watch <process> <key>` - print poller notifications

use super::Target;
use crate::cli_output;
use colored::*;
use procstate_core::{ChangePoller, PollEvent, PollerConfig, ProcStateResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn print_event(process: &str, key: &str, event: &PollEvent) {
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    match event {
        PollEvent::Initial(value) => println!(
            "{} {} {}.{} = {}",
            now,
            "INITIAL".cyan().bold(),
            process,
            key,
            cli_output::format_value(value)
        ),
        PollEvent::Changed(value) => println!(
            "{} {} {}.{} = {}",
            now,
            "CHANGED".green().bold(),
            process,
            key,
            cli_output::format_value(value)
        ),
        PollEvent::Invalid => println!(
            "{} {} {}.{}",
            now,
            "INVALID".red().bold(),
            process,
            key
        ),
    }
}

pub fn run_watch(
    target: &Target,
    process: &str,
    key: &str,
    interval_ms: u64,
    heartbeat_timeout_ms: Option<u64>,
    count: Option<usize>,
) -> ProcStateResult<()> {
    let registry = target.open(true)?;
    let handle = registry.handle_for(process)?;

    let mut config = PollerConfig::new(Duration::from_millis(interval_ms.max(1)));
    if let Some(ms) = heartbeat_timeout_ms {
        config = config.with_heartbeat_timeout(Duration::from_millis(ms));
    }
    let poller = ChangePoller::spawn(handle, key, config)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    eprintln!(
        "{} watching {}.{} every {}ms (Ctrl+C to stop)",
        "WATCH".cyan().bold(),
        process,
        key,
        interval_ms
    );

    let mut seen = 0usize;
    while running.load(Ordering::SeqCst) && count.map_or(true, |n| seen < n) {
        if let Ok(event) = poller.events().recv_timeout(Duration::from_millis(100)) {
            print_event(process, key, &event);
            seen += 1;
        }
    }

    poller.stop();
    Ok(())
}
