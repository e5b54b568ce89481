//! Human-readable byte counts for cache housekeeping logs.

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

fn magnitude(bytes: i64) -> usize {
    let mut value = bytes.abs();
    let mut magnitude = 0;
    while value >= 1024 && magnitude < UNITS.len() - 1 {
        value /= 1024;
        magnitude += 1;
    }
    magnitude
}

fn format_at(bytes: i64, magnitude: usize) -> String {
    if magnitude == 0 {
        format!("{} B", bytes)
    } else {
        format!(
            "{:.1} {}",
            bytes as f64 / 1024f64.powi(magnitude as i32),
            UNITS[magnitude]
        )
    }
}

/// Formats a byte count with the unit best suited to its own size.
pub fn format_bytes(bytes: i64) -> String {
    format_at(bytes, magnitude(bytes))
}

/// Formats `bytes` with the unit suited to `reference`, so that related
/// figures in a single log line (taken vs. budget) share a unit.
pub fn format_bytes_with_magnitude(bytes: i64, reference: i64) -> String {
    format_at(bytes, magnitude(reference))
}
