pub mod pipeline;
pub mod volumes;

use chrono::{DateTime, Utc};
use executor::types::{BackupFormat, BackupScope, SnapshotType};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub use pipeline::BackupPipeline;

/// States of one unit's backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BackupStage {
    Idle,
    PreHook,
    Stopping,
    SnapshotRecipes,
    SnapshotNetworks,
    SnapshotVolumes,
    Starting,
    PostHook,
    RetentionApply,
    DrBundleUpdate,
    Done,
    Aborted(String),
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStage::Aborted(reason) => write!(f, "aborted: {}", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotOutcome {
    pub kind: SnapshotType,
    pub volume: Option<String>,
    pub snapshot_id: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeOutcome {
    pub volume: String,
    pub format: BackupFormat,
    pub result: Result<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub unit: String,
    pub backup_id: String,
    pub scope: BackupScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: BackupStage,
    pub snapshots: Vec<SnapshotOutcome>,
    pub volumes: Vec<VolumeOutcome>,
    pub restarted: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub interrupted: bool,
}

impl BackupReport {
    pub fn new(unit: &str, backup_id: &str, scope: BackupScope, started_at: DateTime<Utc>) -> Self {
        Self {
            unit: unit.to_string(),
            backup_id: backup_id.to_string(),
            scope,
            started_at,
            finished_at: None,
            stage: BackupStage::Idle,
            snapshots: Vec::new(),
            volumes: Vec::new(),
            restarted: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            interrupted: false,
        }
    }

    pub fn success(&self) -> bool {
        self.stage == BackupStage::Done && self.errors.is_empty()
    }

    pub fn failed_volumes(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter(|v| v.result.is_err())
            .map(|v| v.volume.as_str())
            .collect()
    }
}

/// `<UTC yyyymmddTHHMMSS>-<8 hex>`, shared by every snapshot of one run
pub fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_id_has_timestamp_and_random_suffix() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap();
        let a = new_backup_id(now);
        let b = new_backup_id(now);

        assert!(a.starts_with("20260301T023000-"));
        assert_eq!(a.len(), "20260301T023000-".len() + 8);
        assert_ne!(a, b);
    }
}
