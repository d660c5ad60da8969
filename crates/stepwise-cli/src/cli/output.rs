//! Shared terminal formatting.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use stepwise_types::run::NodeStatus;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header.iter().map(|h| Cell::new(h).fg(Color::White)));
    table
}

pub fn status_color(status: NodeStatus) -> Color {
    match status {
        NodeStatus::CacheHit => Color::DarkGrey,
        NodeStatus::Succeeded => Color::Green,
        NodeStatus::Failed => Color::Red,
        NodeStatus::Skipped => Color::Yellow,
        NodeStatus::Pending | NodeStatus::Queued | NodeStatus::Running => Color::White,
    }
}

pub fn status_cell(status: NodeStatus) -> Cell {
    Cell::new(status.as_str()).fg(status_color(status))
}

pub fn check_mark(ok: bool) -> String {
    if ok {
        format!("{}", style("✓").green())
    } else {
        format!("{}", style("✗").red())
    }
}

/// `850ms`, `12.3s`, `4m05s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

pub fn format_bytes(n: u64) -> String {
    if n >= 1 << 30 {
        format!("{:.1} GiB", n as f64 / (1u64 << 30) as f64)
    } else if n >= 1 << 20 {
        format!("{:.1} MiB", n as f64 / (1u64 << 20) as f64)
    } else if n >= 1 << 10 {
        format!("{:.1} KiB", n as f64 / (1u64 << 10) as f64)
    } else {
        format!("{n} B")
    }
}
