//! Host load measurements reported in the latency header and `/loading/get`.
//!
//! Both readers degrade to 0.0 when the proc files are unreadable, so the
//! telemetry path never fails on an unexpected platform.

use std::fs;
use std::sync::OnceLock;
use std::thread;

static NUMBER_CORES: OnceLock<usize> = OnceLock::new();

fn number_cores() -> usize {
    *NUMBER_CORES
        .get_or_init(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

/// One-minute load average divided by the logical core count, clamped to 1.0.
pub fn cpu_utilization() -> f64 {
    let Ok(content) = fs::read_to_string("/proc/loadavg") else {
        return 0.0;
    };

    let Some(load) = content.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) else {
        return 0.0;
    };

    (load / number_cores() as f64).min(1.0)
}

/// `1 - MemAvailable / MemTotal` from `/proc/meminfo`.
pub fn memory_utilization() -> f64 {
    let Ok(content) = fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };

    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kilobytes(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kilobytes(rest);
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }

    match (total, available) {
        (Some(total), Some(available)) if total > 0 => 1.0 - available as f64 / total as f64,
        _ => 0.0,
    }
}

fn parse_kilobytes(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}
