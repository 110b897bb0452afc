//! Persistence layer.
//!
//! Writes the end-of-session report (closed trades, breaker snapshots,
//! totals) to a JSON file. Positions are never restored from disk; every
//! session starts flat.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::report::SessionReport;

/// Default report file path.
const DEFAULT_REPORT_FILE: &str = "sentinel_report.json";

/// Save a session report to a JSON file.
pub fn save_report(report: &SessionReport, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);
    let json = serde_json::to_string_pretty(report)
        .context("Failed to serialise session report")?;

    std::fs::write(path, &json)
        .context(format!("Failed to write session report to {path}"))?;

    debug!(path, trades = report.trade_count, "Session report saved");
    Ok(())
}

/// Load a session report. Returns None if the file doesn't exist.
pub fn load_report(path: Option<&str>) -> Result<Option<SessionReport>> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No session report found");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .context(format!("Failed to read session report from {path}"))?;

    let report: SessionReport = serde_json::from_str(&json)
        .context(format!("Failed to parse session report from {path}"))?;

    info!(
        path,
        trades = report.trade_count,
        net_pnl = %report.net_pnl,
        "Session report loaded"
    );

    Ok(Some(report))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
