//! End-of-run summaries printed per unit

use crate::backup::BackupReport;
use crate::constants::summary::MAX_ERRORS_SHOWN;
use crate::restore::RestoreReport;

/// First few errors, then a count of the rest
pub fn truncated_errors(errors: &[String]) -> Vec<String> {
    let mut lines: Vec<String> = errors
        .iter()
        .take(MAX_ERRORS_SHOWN)
        .map(|e| format!("    - {}", e))
        .collect();
    if errors.len() > MAX_ERRORS_SHOWN {
        lines.push(format!("    … and {} more", errors.len() - MAX_ERRORS_SHOWN));
    }
    lines
}

pub fn backup_lines(reports: &[BackupReport]) -> Vec<String> {
    let succeeded = reports.iter().filter(|r| r.success()).count();
    let mut lines = vec![format!(
        "Backup summary: {}/{} units succeeded",
        succeeded,
        reports.len()
    )];

    for report in reports {
        let status = if report.success() {
            "OK"
        } else if report.interrupted {
            "INTERRUPTED"
        } else {
            "FAILED"
        };
        let volumes_ok = report.volumes.iter().filter(|v| v.result.is_ok()).count();
        lines.push(format!(
            "  [{}] {} ({}) {} snapshots, {}/{} volumes",
            status,
            report.unit,
            report.backup_id,
            report.snapshots.len() + volumes_ok,
            volumes_ok,
            report.volumes.len()
        ));
        lines.extend(truncated_errors(&report.errors));
        if !report.warnings.is_empty() {
            lines.push(format!("    ({} warnings)", report.warnings.len()));
        }
    }
    lines
}

pub fn restore_lines(report: &RestoreReport) -> Vec<String> {
    let status = if report.success() {
        "OK"
    } else if report.interrupted {
        "INTERRUPTED"
    } else {
        "FAILED"
    };
    let mut lines = vec![format!(
        "Restore summary: [{}] {} ({})",
        status, report.unit, report.backup_id
    )];

    if let Some(dir) = &report.recipe_dir {
        lines.push(format!("  recipe files: {}", dir.display()));
    }
    if let Some(networks) = &report.networks {
        lines.push(format!(
            "  networks: {} created, {} skipped, {} renamed, {} overwritten",
            networks.created.len(),
            networks.skipped.len(),
            networks.renamed.len(),
            networks.overwritten.len()
        ));
        for (from, to) in &networks.renamed {
            lines.push(format!("    {} -> {}", from, to));
        }
    }
    for volume in &report.volumes {
        let state = match &volume.result {
            Ok(()) => "restored",
            Err(_) => "failed",
        };
        lines.push(format!("  volume {} ({:?}): {}", volume.volume, volume.method, state));
    }
    if !report.left_stopped.is_empty() {
        lines.push(format!(
            "  left stopped: {} (docker start {})",
            report.left_stopped.join(", "),
            report.left_stopped.join(" ")
        ));
    }
    lines.extend(truncated_errors(&report.errors));
    lines
}
