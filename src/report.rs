use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{JobKind, Origin};
use crate::execution::ExecutionSummary;

const MAX_FILE_NAME_BYTES: usize = 255;

/// On-disk record of one finished execution: metadata sidecar plus optional
/// captured streams. The layout is one flat directory,
/// `<ts>_<job>.json` / `.stdout.log` / `.stderr.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub job: ReportJob,
    pub execution: ExecutionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportJob {
    pub name: String,
    pub kind: JobKind,
    pub schedule: String,
    pub command: String,
    pub origin: Origin,
}

/// Base name (no extension) for one execution's sidecar set.
pub fn report_base_name(job_name: &str, date: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        date.format("%Y%m%dT%H%M%S%.3fZ"),
        sanitize_file_name(job_name)
    )
}

/// Make an arbitrary job name safe to use as a flat file name.
///
/// Path separators, null bytes and control characters are replaced, `..`
/// sequences are collapsed, reserved Windows device names are prefixed, the
/// result is forced relative and capped at 255 bytes preserving the
/// extension.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", "_");
    }
    let mut out = out.trim_start_matches(['.', ' ']).to_string();
    if out.is_empty() {
        out = "job".to_string();
    }

    let stem = out.split('.').next().unwrap_or("");
    if is_reserved_device_name(stem) {
        out.insert(0, '_');
    }

    truncate_preserving_extension(&out, MAX_FILE_NAME_BYTES)
}

fn is_reserved_device_name(stem: &str) -> bool {
    let upper = stem.to_ascii_uppercase();
    matches!(upper.as_str(), "CON" | "PRN" | "AUX" | "NUL")
        || (upper.len() == 4
            && (upper.starts_with("COM") || upper.starts_with("LPT"))
            && upper.as_bytes()[3].is_ascii_digit())
}

fn truncate_preserving_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if name.len() - i <= 16 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let keep = max.saturating_sub(ext.len());
    let mut cut = keep.min(stem.len());
    while cut > 0 && !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stem[..cut], ext)
}

/// Write the sidecar set for one execution. Zero-length stream logs are
/// omitted entirely rather than written empty.
pub fn write_report(
    dir: &Path,
    report: &Report,
    stdout: &[u8],
    stderr: &[u8],
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let base = report_base_name(&report.job.name, report.execution.date);

    let json_path = dir.join(format!("{base}.json"));
    let body = serde_json::to_vec_pretty(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&json_path, body)?;

    if !stdout.is_empty() {
        std::fs::write(dir.join(format!("{base}.stdout.log")), stdout)?;
    }
    if !stderr.is_empty() {
        std::fs::write(dir.join(format!("{base}.stderr.log")), stderr)?;
    }
    Ok(json_path)
}

/// Read persisted reports newer than `max_age` back from `dir`, oldest
/// first. Only `.json` sidecars are considered. Malformed or stale files
/// are skipped with a debug log; restores never fail the daemon.
pub fn restore_reports(dir: &Path, max_age: Duration, now: DateTime<Utc>) -> Vec<Report> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "report directory not readable, skipping restore");
            return Vec::new();
        }
    };

    let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let mut reports = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "unreadable report, skipping");
                continue;
            }
        };
        let mut report: Report = match serde_json::from_str(&raw) {
            Ok(report) => report,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "malformed report, skipping");
                continue;
            }
        };
        if report.execution.date < cutoff {
            continue;
        }
        // A restored run can never still be running.
        report.execution.is_running = false;
        reports.push(report);
    }
    reports.sort_by_key(|r| r.execution.date);
    reports
}
