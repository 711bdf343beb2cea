//! Formatting helpers shared by the report and the content index

use chrono::{DateTime, Local};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const TIME_FORMAT_FILE: &str = "%Y-%m-%d_%H-%M-%S";

const MB_PER_GB_DECIMAL: u64 = 1_000;
const MB_PER_TB_DECIMAL: u64 = 1_000_000;

/// Per-folder size with decimal units: above 1 000 000 MB in TB, above
/// 1 000 MB in GB, otherwise whole MB
pub fn format_folder_size(size_mb: u64) -> String {
    if size_mb > MB_PER_TB_DECIMAL {
        format!("{:.2} TB", size_mb as f64 / MB_PER_TB_DECIMAL as f64)
    } else if size_mb > MB_PER_GB_DECIMAL {
        format!("{:.2} GB", size_mb as f64 / MB_PER_GB_DECIMAL as f64)
    } else {
        format!("{} MB", size_mb)
    }
}

/// Aggregate tape size in TB using 1024-based division. Deliberately not the
/// decimal unit of [`format_folder_size`].
pub fn binary_tb(size_mb: u64) -> f64 {
    (size_mb as f64 / 1024.0) / 1024.0
}

/// MB/s, 0 when no time elapsed
pub fn throughput_mb_s(size_mb: u64, duration_secs: u64) -> f64 {
    if duration_secs == 0 {
        0.0
    } else {
        size_mb as f64 / duration_secs as f64
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration_secs: f64) -> String {
    if duration_secs < 60.0 {
        format!("{:.1}s", duration_secs)
    } else if duration_secs < 3600.0 {
        let minutes = (duration_secs / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}m {:.1}s", minutes, seconds)
    } else {
        let hours = (duration_secs / 3600.0) as u32;
        let minutes = ((duration_secs % 3600.0) / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}h {}m {:.1}s", hours, minutes, seconds)
    }
}

pub fn format_time(time: &DateTime<Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn format_file_time(time: &DateTime<Local>) -> String {
    time.format(TIME_FORMAT_FILE).to_string()
}
