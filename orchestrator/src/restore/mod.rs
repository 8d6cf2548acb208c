pub mod networks;
pub mod pipeline;
pub mod session;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

pub use networks::{
    ConflictPolicy, ConflictPrompt, ConflictResolution, NetworkRestoreReport, StdinPrompt,
};
pub use pipeline::RestorePipeline;
pub use session::{detect_format, group_sessions, host_summaries, HostSummary, RestoreSession, VolumeRestoreMethod};

/// What to replay from a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSelection {
    /// `None` restores every volume of the session
    pub volumes: Option<Vec<String>>,
    pub networks: bool,
    pub volumes_enabled: bool,
}

impl Default for RestoreSelection {
    fn default() -> Self {
        Self {
            volumes: None,
            networks: true,
            volumes_enabled: true,
        }
    }
}

impl RestoreSelection {
    pub fn includes_volume(&self, name: &str) -> bool {
        self.volumes_enabled
            && self
                .volumes
                .as_ref()
                .map_or(true, |selected| selected.iter().any(|v| v == name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RestoreStage {
    Idle,
    PreHook,
    Recipe,
    Networks,
    Volumes,
    PostHook,
    Done,
    Aborted(String),
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStage::Aborted(reason) => write!(f, "aborted: {}", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeRestoreOutcome {
    pub volume: String,
    pub method: VolumeRestoreMethod,
    pub result: Result<(), String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub unit: String,
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: RestoreStage,
    /// Where the recipe files were written for inspection
    pub recipe_dir: Option<PathBuf>,
    pub networks: Option<NetworkRestoreReport>,
    pub volumes: Vec<VolumeRestoreOutcome>,
    pub restarted: Vec<String>,
    /// Containers deliberately not restarted after an interrupt
    pub left_stopped: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub interrupted: bool,
}

impl RestoreReport {
    pub fn new(unit: &str, backup_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            unit: unit.to_string(),
            backup_id: backup_id.to_string(),
            started_at,
            finished_at: None,
            stage: RestoreStage::Idle,
            recipe_dir: None,
            networks: None,
            volumes: Vec::new(),
            restarted: Vec::new(),
            left_stopped: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            interrupted: false,
        }
    }

    pub fn success(&self) -> bool {
        self.stage == RestoreStage::Done && self.errors.is_empty()
    }
}
