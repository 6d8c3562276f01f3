//! Live metrics dashboard.
//!
//! Consumes the session's metrics channel and repaints a small block in
//! place. When stdout is not a terminal (piped logs, CI), each sample is
//! logged as a plain line instead.

use std::io::{stdout, IsTerminal, Write};
use std::time::Duration;

use crossterm::{cursor, terminal, ExecutableCommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use wormhole_shared::protocol::Metrics;

/// Lines the rendered block occupies.
const BLOCK_LINES: u16 = 4;

pub async fn run(mut rx: mpsc::Receiver<Metrics>, title: String) {
    let interactive = stdout().is_terminal();
    let mut painted = false;
    while let Some(sample) = rx.recv().await {
        if interactive {
            if let Err(e) = render(&title, &sample, painted) {
                warn!("dashboard render failed: {e}");
                return;
            }
            painted = true;
        } else {
            info!("{title}: {}", summary(&sample));
        }
    }
}

fn render(title: &str, sample: &Metrics, repaint: bool) -> std::io::Result<()> {
    let mut out = stdout();
    if repaint {
        out.execute(cursor::MoveUp(BLOCK_LINES))?;
        out.execute(cursor::MoveToColumn(0))?;
        out.execute(terminal::Clear(terminal::ClearType::FromCursorDown))?;
    }
    writeln!(out, "{title}")?;
    writeln!(
        out,
        "  ingress {:>10}   egress {:>10}",
        fmt_bytes(sample.ingress),
        fmt_bytes(sample.egress)
    )?;
    writeln!(out, "  uptime  {}", fmt_duration(Duration::from_nanos(sample.uptime)))?;
    writeln!(
        out,
        "  connections {} total, {} active",
        sample.connection_count, sample.active_connections
    )?;
    out.flush()
}

/// One-line rendition, used for non-interactive output.
pub fn summary(sample: &Metrics) -> String {
    format!(
        "in {} out {} up {} conns {}/{}",
        fmt_bytes(sample.ingress),
        fmt_bytes(sample.egress),
        fmt_duration(Duration::from_nanos(sample.uptime)),
        sample.active_connections,
        sample.connection_count
    )
}

/// Format a byte count with IEC units.
pub fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a duration as the largest two whole units.
pub fn fmt_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) =
        (total / 86_400, total % 86_400 / 3600, total % 3600 / 60, total % 60);
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1024), "1.0 KiB");
        assert_eq!(fmt_bytes(1_536), "1.5 KiB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(Duration::from_secs(42)), "42s");
        assert_eq!(fmt_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(fmt_duration(Duration::from_secs(3_661)), "1h1m");
        assert_eq!(fmt_duration(Duration::from_secs(90_000)), "1d1h");
    }

    #[test]
    fn test_summary_mentions_counts() {
        let sample = Metrics {
            ingress: 2048,
            egress: 0,
            uptime: 1_000_000_000,
            connection_count: 7,
            active_connections: 2,
        };
        let line = summary(&sample);
        assert!(line.contains("2.0 KiB"));
        assert!(line.contains("2/7"));
    }
}
