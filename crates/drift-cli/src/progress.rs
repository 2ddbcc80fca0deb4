//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use drift_core::TransferSnapshot;

/// Transfer progress tracker
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(total_bytes: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .expect("Invalid progress bar template")
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Transferring: {label}"));
        Self { bar }
    }

    /// Update the bar from a transfer snapshot
    pub fn update(&self, snapshot: &TransferSnapshot) {
        self.bar.set_position(snapshot.bytes_done);
        if let Some(speed) = snapshot.speed_bps {
            let eta = snapshot
                .eta_seconds
                .map(format_eta)
                .unwrap_or_else(|| "-".to_string());
            self.bar
                .set_message(format!("{} ({}, eta {eta})", snapshot.status, format_speed(speed)));
        }
    }

    /// Finish with a message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable form, e.g. `1.50 KB`
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a speed in bytes per second, e.g. `1.00 MB/s`
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format a duration, e.g. `1m 30s`
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format an ETA given in fractional seconds
#[must_use]
pub fn format_eta(seconds: f64) -> String {
    format_duration(Duration::from_secs_f64(seconds.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1_048_576.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(30.0), "30s");
        assert_eq!(format_eta(-5.0), "0s");
    }
}
