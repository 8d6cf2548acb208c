//! Per-volume snapshot tasks on a bounded worker pool

use executor::types::{BackupFormat, SnapshotTags, VolumeRef};
use futures::stream::{self, StreamExt};
use std::path::Path;
use tracing::{error, info, warn};

use super::VolumeOutcome;
use crate::context::PipelineContext;
use crate::retention::stream_path;

/// Direct snapshots need a local driver and a mountpoint this host can read
pub async fn choose_format(volume: &VolumeRef) -> BackupFormat {
    match &volume.mountpoint {
        Some(mountpoint) if volume.driver == "local" && path_exists(mountpoint).await => {
            BackupFormat::Direct
        }
        _ => BackupFormat::Stream,
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Snapshot every volume with at most `workers` running at once. One
/// volume's failure never cancels its siblings.
pub async fn snapshot_volumes(
    ctx: &PipelineContext,
    unit: &str,
    volumes: &[VolumeRef],
    base_tags: &SnapshotTags,
    excludes: &[String],
    workers: usize,
) -> Vec<VolumeOutcome> {
    info!(unit, count = volumes.len(), workers, "Snapshotting volumes");
    let tasks: Vec<_> = volumes
        .iter()
        .map(|volume| snapshot_volume(ctx, unit, volume, base_tags, excludes))
        .collect();
    stream::iter(tasks)
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}

async fn snapshot_volume(
    ctx: &PipelineContext,
    unit: &str,
    volume: &VolumeRef,
    base_tags: &SnapshotTags,
    excludes: &[String],
) -> VolumeOutcome {
    let format = choose_format(volume).await;
    if ctx.coordinator.cleanup_started() {
        return VolumeOutcome {
            volume: volume.name.clone(),
            format,
            result: Err("interrupted before start".to_string()),
        };
    }

    let tags = base_tags.clone().with_volume(&volume.name, format);
    let result = match (format, &volume.mountpoint) {
        (BackupFormat::Direct, Some(mountpoint)) => {
            ctx.snapshots
                .create_snapshot(mountpoint, &tags, excludes)
                .await
        }
        _ => {
            let producer = ctx.engine.volume_archive_command(&volume.name);
            let virtual_path = stream_path(unit, &volume.name);
            warn!(unit, volume = %volume.name, driver = %volume.driver, "Mountpoint not usable, streaming volume archive");
            ctx.snapshots
                .create_snapshot_from_stream(&producer, &virtual_path, &tags)
                .await
        }
    };

    match result {
        Ok(snapshot_id) => {
            info!(unit, volume = %volume.name, snapshot = %snapshot_id, format = format.as_tag(), "Volume snapshot created");
            VolumeOutcome {
                volume: volume.name.clone(),
                format,
                result: Ok(snapshot_id),
            }
        }
        Err(e) => {
            error!(unit, volume = %volume.name, "Volume snapshot failed: {:#}", e);
            VolumeOutcome {
                volume: volume.name.clone(),
                format,
                result: Err(format!("{:#}", e)),
            }
        }
    }
}
