//! Output helpers shared by all `procstate` commands.
//!
//! Status lines go through these helpers so the CLI stays consistent; raw
//! values (`get`, `swap`, JSON) are printed unadorned for scripting.

use colored::*;
use std::time::Duration;

pub const ICON_SUCCESS: &str = "\u{2713}"; // ✓
pub const ICON_WARN: &str = "\u{26a0}"; // ⚠
pub const ICON_INFO: &str = "\u{25b6}"; // ▶
pub const ICON_HINT: &str = "\u{00b7}"; // ·

/// ✓ message
pub fn success(msg: &str) {
    println!("{} {}", ICON_SUCCESS.green(), msg);
}

/// ⚠ message
pub fn warn(msg: &str) {
    println!("{} {}", ICON_WARN.yellow(), msg);
}

/// ▶ message
pub fn info(msg: &str) {
    println!("{} {}", ICON_INFO.cyan(), msg);
}

/// Dimmed hint on stderr, so it never pollutes piped values
pub fn hint(msg: &str) {
    eprintln!("  {} {}", ICON_HINT.dimmed(), msg.dimmed());
}

pub fn header(msg: &str) {
    println!("{}", msg.cyan().bold());
}

/// Empty-state message with an optional tip
pub fn empty(msg: &str, tip: Option<&str>) {
    println!("{}", msg.yellow());
    if let Some(t) = tip {
        hint(t);
    }
}

/// Compact age: `850ms`, `12s`, `3m 4s`, `2h 5m`
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs == 0 {
        format!("{}ms", age.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Local wall-clock time of a millisecond Unix timestamp
pub fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

/// Parameter bytes for display: text if printable UTF-8, hex otherwise
pub fn format_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) if !s.chars().any(|c| c.is_control() && c != '\t') => s.to_string(),
        _ => {
            let hex: Vec<String> = value.iter().map(|b| format!("{:02x}", b)).collect();
            format!("0x{}", hex.join(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages() {
        assert_eq!(format_age(Duration::from_millis(850)), "850ms");
        assert_eq!(format_age(Duration::from_secs(12)), "12s");
        assert_eq!(format_age(Duration::from_secs(184)), "3m 4s");
        assert_eq!(format_age(Duration::from_secs(7500)), "2h 5m");
    }

    #[test]
    fn values() {
        assert_eq!(format_value(b"scan"), "scan");
        assert_eq!(format_value(&[0, 1, 0xff]), "0x0001ff");
        assert_eq!(format_value(b""), "");
    }
}
