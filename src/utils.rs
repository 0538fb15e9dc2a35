//! # Utility Functions
//!
//! Small helpers shared by the engine and the reporting layer.
//!
//! ## Key Functionality Categories
//!
//! - **Identifiers**: random ids for runs and combinations
//! - **Formatting**: human-readable durations, percentages and stats lines
//! - **System Information**: platform details recorded with every run

use crate::stats::Stats;
use std::time::Duration;
use uuid::Uuid;

/// Generate the identifier of a combination
///
/// The id is part of the combination's endpoint path, `/rpc/<id>`, so it must
/// be unique within a run and safe to use in a URL. A UUID v4 in its
/// hyphenated form is both.
pub fn generate_combination_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the identifier of a run, stored in the results file
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration given in (possibly fractional) nanoseconds
///
/// Task durations are medians of per-iteration timings, so a fast task
/// can take a fraction of a nanosecond.
///
/// ## Unit Selection
///
/// - **Nanoseconds**: < 1,000 ns, with 2 decimals below 10 ns (e.g., "0.35ns",
///   "512ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds and up**: see [`format_duration`]
///
/// ## Examples
///
/// ```rust
/// # use combench::utils::format_nanos;
/// assert_eq!(format_nanos(0.354), "0.35ns");
/// assert_eq!(format_nanos(512.0), "512ns");
/// assert_eq!(format_nanos(1500.0), "1.50μs");
/// assert_eq!(format_nanos(1_500_000.0), "1.50ms");
/// ```
pub fn format_nanos(ns: f64) -> String {
    if !ns.is_finite() || ns < 0.0 {
        return format!("{}ns", ns);
    }
    if ns < 10.0 {
        format!("{:.2}ns", ns)
    } else if ns < 1_000.0 {
        format!("{:.0}ns", ns)
    } else if ns < 1_000_000.0 {
        format!("{:.2}μs", ns / 1_000.0)
    } else if ns < 1_000_000_000.0 {
        format!("{:.2}ms", ns / 1_000_000.0)
    } else {
        format_duration(Duration::from_nanos(ns as u64))
    }
}

/// Format a duration in a human-readable way
///
/// Sub-second durations use 2 decimals, longer ones a compound format.
///
/// ```rust
/// # use combench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000_000_000 {
        return format_nanos(total_ns as f64);
    }
    if total_ns < 60_000_000_000 {
        return format!("{:.2}s", total_ns as f64 / 1_000_000_000.0);
    }

    let seconds = duration.as_secs();
    let minutes = seconds / 60;
    let remaining_seconds = seconds % 60;
    if minutes < 60 {
        format!("{}m {}s", minutes, remaining_seconds)
    } else {
        format!("{}h {}m {}s", minutes / 60, minutes % 60, remaining_seconds)
    }
}

/// Format a relative difference, `0.25` being "+25%".
pub fn format_percent(ratio: f64) -> String {
    let percent = ratio * 100.0;
    if percent.abs() < 10.0 {
        format!("{:+.1}%", percent)
    } else {
        format!("{:+.0}%", percent)
    }
}

/// One-line rendering of a median and its margin of error, e.g.
/// "1.02ms ± 0.85%".
pub fn format_stats(stats: &Stats) -> String {
    match stats.rmoe {
        Some(rmoe) => format!("{} ± {:.2}%", format_nanos(stats.median), rmoe * 100.0),
        None => format_nanos(stats.median),
    }
}

/// Get the number of logical CPU cores, as reported by `num_cpus`
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}
