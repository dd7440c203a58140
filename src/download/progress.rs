use std::collections::VecDeque;

const UNITS: &[&str] = &["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Snapshot handed to progress callbacks on every host "updated" tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub url: String,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Bytes received since the previous tick.
    pub speed_bps: u64,
    pub received_human: String,
    pub total_human: String,
    pub speed_human: String,
}

impl ProgressInfo {
    pub fn new(url: &str, received_bytes: u64, total_bytes: u64, speed_bps: u64) -> Self {
        Self {
            url: url.to_string(),
            received_bytes,
            total_bytes,
            percent: percent(received_bytes, total_bytes),
            speed_bps,
            received_human: format_bytes(received_bytes),
            total_human: format_bytes(total_bytes),
            speed_human: format_speed(speed_bps),
        }
    }
}

/// Keeps the two most recent received-byte samples.
///
/// The reported speed is the difference between them, so it is a per-tick
/// delta rather than a time-normalised rate.
#[derive(Debug, Default)]
pub struct SpeedSampler {
    samples: VecDeque<u64>,
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, received: u64) -> u64 {
        self.samples.push_back(received);
        if self.samples.len() > 2 {
            self.samples.pop_front();
        }

        match (self.samples.front(), self.samples.back()) {
            (Some(&a), Some(&b)) if self.samples.len() == 2 => a.max(b) - a.min(b),
            _ => 0,
        }
    }
}

pub fn percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    received as f64 * 100.0 / total as f64
}

pub fn format_bytes(bytes: u64) -> String {
    format_bytes_with(bytes, 2)
}

/// Scales by 1000 through Bytes..YB.
pub fn format_bytes_with(bytes: u64, decimals: usize) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1000.0 && unit_index < UNITS.len() - 1 {
        size /= 1000.0;
        unit_index += 1;
    }

    format!("{:.*} {}", decimals, size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_tick: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_tick))
}
