//! Retention applied per stable source path
//!
//! restic groups snapshots by host and path before applying `forget`
//! rules, so each unit's recipe, docker_config and networks directories and
//! each volume path are pruned independently of every other unit.

use executor::services::restic::SnapshotEngine;
use executor::types::{BackupUnit, RetentionPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::constants::paths::STREAM_PATH_PREFIX;
use crate::staging::StagingLayout;

/// Virtual path of a streamed volume snapshot
pub fn stream_path(unit: &str, volume: &str) -> String {
    format!("{}/{}/{}.tar", STREAM_PATH_PREFIX, unit, volume)
}

pub struct RetentionCoordinator {
    snapshots: Arc<dyn SnapshotEngine>,
    policy: RetentionPolicy,
}

impl RetentionCoordinator {
    pub fn new(snapshots: Arc<dyn SnapshotEngine>, policy: RetentionPolicy) -> Self {
        Self { snapshots, policy }
    }

    /// Every source path snapshots of `unit` can have
    pub fn unit_paths(staging: &StagingLayout, unit: &BackupUnit) -> Vec<PathBuf> {
        let mut paths = staging.source_paths(&unit.name);
        for volume in &unit.volumes {
            if let Some(mountpoint) = &volume.mountpoint {
                paths.push(mountpoint.clone());
            }
            paths.push(PathBuf::from(stream_path(&unit.name, &volume.name)));
        }
        paths
    }

    /// Apply the policy to each path; failures come back as warnings
    pub async fn apply(&self, unit: &str, paths: &[PathBuf]) -> Vec<String> {
        if self.policy.is_empty() {
            return Vec::new();
        }

        let mut warnings = Vec::new();
        for path in paths {
            if let Err(e) = self
                .snapshots
                .apply_retention_policy(path, &self.policy)
                .await
            {
                warn!(unit, path = %path.display(), "Retention failed: {:#}", e);
                warnings.push(format!("retention {}: {:#}", path.display(), e));
            }
        }
        info!(unit, paths = paths.len(), "Retention policy applied");
        warnings
    }
}
