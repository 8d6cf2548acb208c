//! Replays one restore session
//!
//! Order: pre-restore hook, recipe to scratch, networks, volumes,
//! post-restore hook. While volumes are written a `DataSafetyHandler` is
//! registered: on interrupt the containers stopped for the restore stay down
//! and scratch directories are removed.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use executor::exit_safety::{DataSafetyHandler, GenericCleanupHandler, HandlerId};
use executor::services::hooks::HookKind;
use executor::types::{NetworkSpec, SnapshotRecord};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

use super::networks::{restore_networks, ConflictPolicy, ConflictPrompt};
use super::session::{detect_format, RestoreSession, VolumeRestoreMethod};
use super::{RestoreReport, RestoreSelection, RestoreStage, VolumeRestoreOutcome};
use crate::context::PipelineContext;
use crate::retention::stream_path;
use crate::staging::{sanitize, NETWORKS_FILE};

pub struct RestorePipeline {
    ctx: PipelineContext,
}

/// Path a snapshot's first source path lands at under a restore target
fn restored_path(target: &Path, record: &SnapshotRecord) -> PathBuf {
    match record.paths.first() {
        Some(source) => target.join(source.trim_start_matches('/')),
        None => target.to_path_buf(),
    }
}

impl RestorePipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    fn scratch_dir(&self, session: &RestoreSession) -> PathBuf {
        self.ctx.config.scratch_root.join(format!(
            "{}-{}",
            sanitize(&session.unit),
            sanitize(&session.backup_id)
        ))
    }

    #[instrument(skip_all, fields(unit = %session.unit, backup_id = %session.backup_id))]
    pub async fn run(
        &self,
        session: &RestoreSession,
        selection: &RestoreSelection,
        policy: ConflictPolicy,
        prompt: &dyn ConflictPrompt,
    ) -> RestoreReport {
        let mut report = RestoreReport::new(&session.unit, &session.backup_id, Utc::now());
        let hooks = self.ctx.config.unit(&session.unit).hooks;
        let hook_timeout = self.ctx.config.timeouts.hook();
        let scratch = self.scratch_dir(session);
        info!(host = %session.hostname, records = session.record_count(), "Starting restore");

        // === PreHook ===
        report.stage = RestoreStage::PreHook;
        if let Err(e) = self
            .ctx
            .hooks
            .run_gated(HookKind::PreRestore, &session.unit, &hooks, hook_timeout)
            .await
        {
            error!("Restore aborted: {}", e);
            report.errors.push(e.to_string());
            return finish(report, RestoreStage::Aborted(e.to_string()));
        }

        // === Recipe ===
        report.stage = RestoreStage::Recipe;
        if let Some(recipe) = &session.recipe {
            let target = scratch.join("recipe");
            let guard = self.guard_scratch(&target, "remove recipe scratch");
            let restored = self.restore_to(recipe, &target).await;
            if self.ctx.coordinator.cleanup_started() {
                // The handler may have run before the restore stopped writing
                remove_scratch(&target).await;
            } else {
                // Kept for review after a completed restore
                self.ctx.coordinator.unregister_handler(guard);
                match restored {
                    Ok(()) => {
                        let dir = restored_path(&target, recipe);
                        info!(dir = %dir.display(), "Recipe files restored for review");
                        report.recipe_dir = Some(dir);
                    }
                    Err(e) => {
                        error!("Recipe restore failed: {:#}", e);
                        report.errors.push(format!("recipe restore failed: {:#}", e));
                    }
                }
            }
        } else {
            report.warnings.push("session has no recipe snapshot".to_string());
        }

        if self.ctx.coordinator.cleanup_started() {
            report.interrupted = true;
            return finish(report, RestoreStage::Aborted("interrupted".to_string()));
        }

        // === Networks ===
        if selection.networks {
            if let Some(record) = &session.networks {
                report.stage = RestoreStage::Networks;
                let effective = policy.effective(self.ctx.config.non_interactive);
                match self.replay_networks(record, &scratch, effective, prompt).await {
                    Ok(networks) => {
                        report.errors.extend(networks.failures.iter().cloned());
                        report.networks = Some(networks);
                    }
                    Err(e) => {
                        error!("Network restore failed: {:#}", e);
                        report.errors.push(format!("network restore failed: {:#}", e));
                    }
                }
            }
        }

        // === Volumes ===
        let selected: Vec<&SnapshotRecord> = session
            .volumes
            .iter()
            .filter(|r| {
                r.tags
                    .volume
                    .as_deref()
                    .is_some_and(|name| selection.includes_volume(name))
            })
            .collect();
        if let Some(wanted) = &selection.volumes {
            for name in wanted {
                if session.find_volume(name).is_none() {
                    report
                        .warnings
                        .push(format!("volume {} is not part of this session", name));
                }
            }
        }

        if !selected.is_empty() && !self.ctx.coordinator.cleanup_started() {
            report.stage = RestoreStage::Volumes;
            self.restore_volumes(&session.unit, &selected, &scratch, &mut report)
                .await;
        }

        if self.ctx.coordinator.cleanup_started() {
            report.interrupted = true;
            warn!("Restore interrupted; containers stay stopped until volumes are checked");
            return finish(report, RestoreStage::Aborted("interrupted".to_string()));
        }

        // === PostHook ===
        report.stage = RestoreStage::PostHook;
        match self
            .ctx
            .hooks
            .run_gated(HookKind::PostRestore, &session.unit, &hooks, hook_timeout)
            .await
        {
            Ok(Some(warning)) => report.warnings.push(warning),
            Ok(None) => {}
            Err(e) => report.warnings.push(e.to_string()),
        }

        finish(report, RestoreStage::Done)
    }

    async fn restore_to(&self, record: &SnapshotRecord, target: &Path) -> Result<()> {
        if fs::try_exists(target).await.unwrap_or(false) {
            fs::remove_dir_all(target)
                .await
                .with_context(|| format!("Failed to clear {}", target.display()))?;
        }
        fs::create_dir_all(target)
            .await
            .with_context(|| format!("Failed to create {}", target.display()))?;
        self.ctx.snapshots.restore_snapshot(&record.id, target).await
    }

    /// Remove `dir` if cleanup runs before the stage that writes it finishes
    fn guard_scratch(&self, dir: &Path, name: &str) -> HandlerId {
        let scratch_cleanup = Arc::new(GenericCleanupHandler::new());
        let dir = dir.to_path_buf();
        scratch_cleanup.add_fn(name, move || {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        });
        self.ctx.coordinator.register_handler(scratch_cleanup)
    }

    async fn replay_networks(
        &self,
        record: &SnapshotRecord,
        scratch: &Path,
        policy: ConflictPolicy,
        prompt: &dyn ConflictPrompt,
    ) -> Result<super::NetworkRestoreReport> {
        let target = scratch.join("networks");
        let handler_id = self.guard_scratch(&target, "remove network scratch");

        let result = async {
            self.restore_to(record, &target).await?;
            let file = restored_path(&target, record).join(NETWORKS_FILE);
            let content = fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let documents: Vec<Value> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid network definitions in {}", file.display()))?;
            let specs: Vec<NetworkSpec> =
                documents.iter().filter_map(NetworkSpec::from_inspect).collect();
            debug!(count = specs.len(), policy = ?policy, "Recreating networks");
            restore_networks(self.ctx.engine.as_ref(), &specs, policy, prompt).await
        }
        .await;

        remove_scratch(&target).await;
        if !self.ctx.coordinator.cleanup_started() {
            self.ctx.coordinator.unregister_handler(handler_id);
        }
        result
    }

    async fn restore_volumes(
        &self,
        unit: &str,
        selected: &[&SnapshotRecord],
        scratch: &Path,
        report: &mut RestoreReport,
    ) {
        let safety = Arc::new(DataSafetyHandler::new(unit));
        let handler_id = self.ctx.coordinator.register_handler(safety.clone());

        let names: Vec<&str> = selected
            .iter()
            .filter_map(|r| r.tags.volume.as_deref())
            .collect();
        let stop_ok = self.stop_volume_users(&names, &safety, report).await;

        if stop_ok {
            for record in selected {
                if self.ctx.coordinator.cleanup_started() {
                    break;
                }
                let outcome = self.restore_volume(unit, record, scratch, &safety).await;
                if let Err(reason) = &outcome.result {
                    report
                        .errors
                        .push(format!("volume {} failed: {}", outcome.volume, reason));
                }
                report.volumes.push(outcome);
            }
        }

        if self.ctx.coordinator.cleanup_started() {
            // DataSafety owns the containers and temp dirs from here
            report.left_stopped = safety.stopped().into_iter().map(|c| c.name).collect();
            return;
        }

        for dir in safety.temp_dirs() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                debug!("Failed to remove {}: {}", dir.display(), e);
            }
            safety.unregister_temp_dir(&dir);
        }
        let stopped = safety.stopped();
        self.ctx.coordinator.unregister_handler(handler_id);

        for container in stopped.iter().rev() {
            info!(container = %container.name, "Starting container after restore");
            match self.ctx.engine.start(&container.id).await {
                Ok(()) => report.restarted.push(container.name.clone()),
                Err(e) => {
                    error!(container = %container.name, "Failed to start container: {:#}", e);
                    report
                        .errors
                        .push(format!("start {} failed: {:#}", container.name, e));
                }
            }
        }
    }

    /// Stop every running container that mounts one of `volumes`
    async fn stop_volume_users(
        &self,
        volumes: &[&str],
        safety: &DataSafetyHandler,
        report: &mut RestoreReport,
    ) -> bool {
        let containers = match self.ctx.engine.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                report
                    .errors
                    .push(format!("listing containers failed: {:#}", e));
                return false;
            }
        };

        let timeout = self.ctx.config.timeouts.stop();
        for container in containers.iter().filter(|c| c.running) {
            if !container.volume_names().any(|v| volumes.contains(&v)) {
                continue;
            }
            if self.ctx.coordinator.cleanup_started() {
                return false;
            }
            safety.register_stopped(&container.id, &container.name);
            info!(container = %container.name, "Stopping container for restore");
            if let Err(e) = self.ctx.engine.stop(&container.id, timeout).await {
                error!(container = %container.name, "Failed to stop container: {:#}", e);
                report
                    .errors
                    .push(format!("stop {} failed: {:#}", container.name, e));
                return false;
            }
        }
        true
    }

    async fn restore_volume(
        &self,
        unit: &str,
        record: &SnapshotRecord,
        scratch: &Path,
        safety: &DataSafetyHandler,
    ) -> VolumeRestoreOutcome {
        let volume = record.tags.volume.clone().unwrap_or_default();
        let method = detect_format(record);
        info!(volume = %volume, ?method, snapshot = %record.short_id, "Restoring volume");

        let result = match method {
            VolumeRestoreMethod::Modern => {
                self.restore_direct(&volume, record, scratch, safety).await
            }
            VolumeRestoreMethod::Legacy => self.restore_streamed(unit, &volume, record).await,
        };
        if let Err(e) = &result {
            error!(volume = %volume, "Volume restore failed: {:#}", e);
        }
        VolumeRestoreOutcome {
            volume,
            method,
            result: result.map_err(|e| format!("{:#}", e)),
        }
    }

    async fn ensure_volume(&self, volume: &str) -> Result<()> {
        if self.ctx.engine.inspect_volume(volume).await?.is_none() {
            self.ctx.engine.create_volume(volume).await?;
        }
        Ok(())
    }

    async fn restore_direct(
        &self,
        volume: &str,
        record: &SnapshotRecord,
        scratch: &Path,
        safety: &DataSafetyHandler,
    ) -> Result<()> {
        let temp = scratch.join(format!("volume-{}", sanitize(volume)));
        safety.register_temp_dir(&temp);
        self.restore_to(record, &temp).await?;

        let source = restored_path(&temp, record);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(anyhow!("restored data missing at {}", source.display()));
        }
        self.ensure_volume(volume).await?;
        let import = self.ctx.engine.volume_import_command(volume, &source);
        self.ctx
            .runner
            .run_checked(&import, Some(self.ctx.config.timeouts.snapshot()))
            .await?;
        Ok(())
    }

    async fn restore_streamed(&self, unit: &str, volume: &str, record: &SnapshotRecord) -> Result<()> {
        self.ensure_volume(volume).await?;
        let path = record
            .paths
            .first()
            .cloned()
            .unwrap_or_else(|| stream_path(unit, volume));
        let extract = self.ctx.engine.volume_extract_command(volume);
        self.ctx
            .snapshots
            .dump_snapshot_to(&record.id, &path, &extract)
            .await
    }
}

async fn remove_scratch(dir: &Path) {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return;
    }
    if let Err(e) = fs::remove_dir_all(dir).await {
        debug!("Failed to remove {}: {}", dir.display(), e);
    }
}

fn finish(mut report: RestoreReport, stage: RestoreStage) -> RestoreReport {
    report.stage = stage;
    report.finished_at = Some(Utc::now());
    if report.success() {
        info!(volumes = report.volumes.len(), "Restore completed");
    } else {
        warn!(stage = %report.stage, errors = report.errors.len(), "Restore finished with errors");
    }
    report
}
