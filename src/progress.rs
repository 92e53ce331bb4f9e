// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte/rate formatting and the one-line progress gauge.

use serde::{Deserialize, Serialize};

/// Number of cells in the gauge bar.
const BAR_WIDTH: usize = 20;

/// Partial-cell glyphs, in eighths of a cell.
const PARTIAL_CELLS: [char; 8] = [' ', '▏', '▎', '▍', '▌', '▋', '▊', '▉'];

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Snapshot of a job's transfer counters from the last poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes downloaded so far.
    pub completed: u64,
    /// Total size in bytes, 0 while unknown.
    pub total: u64,
    /// Download speed in bytes per second.
    pub speed: u64,
}

impl Progress {
    pub fn new(completed: u64, total: u64, speed: u64) -> Self {
        Self { completed, total, speed }
    }

    /// Percentage (0-100). An unknown total counts as 0 %.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let completed = self.completed.min(self.total);
        (completed as f64 / self.total as f64) * 100.0
    }

    /// Render the gauge line, e.g. ` |██████████          | 50.0%  500.0 KB/1000.0 KB  250.0 KB/s`.
    pub fn gauge(&self) -> String {
        render_gauge(self.completed, self.total, self.speed)
    }
}

/// Format a byte count with binary units.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GB", b / GIB)
    } else if b >= MIB {
        format!("{:.1} MB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a transfer rate with binary units.
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

/// Render counters as a gauge line.
///
/// `current` is clamped to a known `total`; a zero `total` renders as 0 %.
pub fn render_gauge(current: u64, total: u64, speed: u64) -> String {
    let shown = if total > 0 { current.min(total) } else { current };
    let progress = Progress::new(shown, total, speed);
    let percent = progress.percent();

    let eighths = ((percent / 100.0) * (BAR_WIDTH * 8) as f64).floor() as usize;
    let full = eighths / 8;
    let mut bar = "█".repeat(full);
    if full < BAR_WIDTH {
        bar.push(PARTIAL_CELLS[eighths % 8]);
        bar.push_str(&" ".repeat(BAR_WIDTH - full - 1));
    }

    format!(
        " |{}| {:.1}%  {}/{}  {}",
        bar,
        percent,
        format_size(progress.completed),
        format_size(total),
        format_speed(speed)
    )
}
