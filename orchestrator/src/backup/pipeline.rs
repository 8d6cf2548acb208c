//! Cold backup of one unit: stop, snapshot, start
//!
//! The pipeline owns a `ServiceContinuityHandler` for the whole run. Every
//! container is registered with it before its stop call goes out and is
//! unregistered only after its start call returned, so an interrupt at any
//! point leaves the handler knowing exactly what still has to come back up.

use chrono::Utc;
use executor::exit_safety::ServiceContinuityHandler;
use executor::services::hooks::HookKind;
use executor::types::{BackupScope, BackupUnit, HealthStatus, SnapshotTags, SnapshotType};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::volumes::snapshot_volumes;
use super::{new_backup_id, BackupReport, BackupStage, SnapshotOutcome};
use crate::config::UnitConfig;
use crate::constants::health::POLL_INTERVAL;
use crate::context::PipelineContext;
use crate::dr_bundle::{self, DrBundleUpdate, DrUnitEntry};
use crate::retention::RetentionCoordinator;

pub struct BackupPipeline {
    ctx: PipelineContext,
}

impl BackupPipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, unit), fields(unit = %unit.name, scope = scope.as_str()))]
    pub async fn run(&self, unit: &BackupUnit, scope: BackupScope) -> BackupReport {
        let started_at = Utc::now();
        let backup_id = new_backup_id(started_at);
        let mut report = BackupReport::new(&unit.name, &backup_id, scope, started_at);
        let unit_config = self.ctx.config.unit(&unit.name);
        let base_tags = SnapshotTags::new(SnapshotType::Recipe, &unit.name, &backup_id, started_at)
            .with_scope(scope);

        info!(backup_id = %backup_id, "Starting backup");

        // === PreHook ===
        report.stage = BackupStage::PreHook;
        if let Err(e) = self
            .ctx
            .hooks
            .run_gated(
                HookKind::PreBackup,
                &unit.name,
                &unit_config.hooks,
                self.ctx.config.timeouts.hook(),
            )
            .await
        {
            error!("Backup aborted: {}", e);
            report.errors.push(e.to_string());
            return self.finish(report, BackupStage::Aborted(e.to_string()));
        }

        let continuity = Arc::new(ServiceContinuityHandler::new(
            &unit.name,
            self.ctx.engine.clone(),
            self.ctx.config.timeouts.start(),
        ));
        let handler_id = self.ctx.coordinator.register_handler(continuity.clone());

        // === Stopping ===
        let stopped_cleanly = match scope {
            BackupScope::Full => {
                report.stage = BackupStage::Stopping;
                self.stop_containers(unit, &continuity, &mut report).await
            }
            BackupScope::Config => true,
        };

        // === Snapshots ===
        if stopped_cleanly && !self.ctx.coordinator.cleanup_started() {
            self.snapshot_unit(unit, scope, &unit_config, &base_tags, &mut report)
                .await;
        }

        // === Starting ===
        report.stage = BackupStage::Starting;
        self.start_containers(unit, &continuity, &mut report).await;

        // After cleanup began the handler owns the skipped restarts and stays registered
        if self.ctx.coordinator.cleanup_started() {
            report.interrupted = true;
            warn!("Backup interrupted; restart handled by exit-safety cleanup");
            return self.finish(report, BackupStage::Aborted("interrupted".to_string()));
        }
        self.ctx.coordinator.unregister_handler(handler_id);

        // === PostHook ===
        report.stage = BackupStage::PostHook;
        match self
            .ctx
            .hooks
            .run_gated(
                HookKind::PostBackup,
                &unit.name,
                &unit_config.hooks,
                self.ctx.config.timeouts.hook(),
            )
            .await
        {
            Ok(Some(warning)) => report.warnings.push(warning),
            Ok(None) => {}
            Err(e) => report.warnings.push(e.to_string()),
        }

        // === RetentionApply ===
        report.stage = BackupStage::RetentionApply;
        if report.errors.is_empty() {
            let retention = RetentionCoordinator::new(
                self.ctx.snapshots.clone(),
                self.ctx.config.retention.clone(),
            );
            let paths = RetentionCoordinator::unit_paths(&self.ctx.staging, unit);
            let warnings = retention.apply(&unit.name, &paths).await;
            report.warnings.extend(warnings);
        } else {
            warn!("Skipping retention because the backup had errors");
        }

        // === DrBundleUpdate ===
        if self.ctx.config.dr_bundle.enabled && report.errors.is_empty() {
            report.stage = BackupStage::DrBundleUpdate;
            if let Err(e) = self.update_dr_bundle(&report).await {
                warn!("DR bundle update failed: {:#}", e);
                report.warnings.push(format!("DR bundle update failed: {:#}", e));
            }
        }

        self.finish(report, BackupStage::Done)
    }

    fn finish(&self, mut report: BackupReport, stage: BackupStage) -> BackupReport {
        report.stage = stage;
        report.finished_at = Some(Utc::now());
        let elapsed = report
            .finished_at
            .map(|end| end.signed_duration_since(report.started_at).num_seconds())
            .unwrap_or_default();
        if report.success() {
            info!(backup_id = %report.backup_id, elapsed_secs = elapsed, "Backup completed");
        } else {
            warn!(
                backup_id = %report.backup_id,
                stage = %report.stage,
                errors = report.errors.len(),
                elapsed_secs = elapsed,
                "Backup finished with errors"
            );
        }
        report
    }

    /// Returns false when a stop failed; the run then goes straight to Starting
    async fn stop_containers(
        &self,
        unit: &BackupUnit,
        continuity: &ServiceContinuityHandler,
        report: &mut BackupReport,
    ) -> bool {
        let timeout = self.ctx.config.stop_timeout_for(&unit.name);
        for container in unit.containers.iter().filter(|c| c.running) {
            if self.ctx.coordinator.cleanup_started() {
                return false;
            }
            continuity.register_container(&container.id, &container.name);
            info!(container = %container.name, "Stopping container");
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

    async fn snapshot_unit(
        &self,
        unit: &BackupUnit,
        scope: BackupScope,
        unit_config: &UnitConfig,
        base_tags: &SnapshotTags,
        report: &mut BackupReport,
    ) {
        report.stage = BackupStage::SnapshotRecipes;
        if let Err(e) = self.snapshot_recipes(unit, base_tags, report).await {
            error!("Recipe snapshot failed: {:#}", e);
            report.errors.push(format!("recipe snapshot failed: {:#}", e));
            return;
        }

        if self.ctx.coordinator.cleanup_started() {
            return;
        }

        report.stage = BackupStage::SnapshotNetworks;
        if unit.networks.is_empty() {
            debug!("No custom networks, skipping network snapshot");
        } else if let Err(e) = self.snapshot_networks(unit, base_tags, report).await {
            error!("Network snapshot failed: {:#}", e);
            report.errors.push(format!("network snapshot failed: {:#}", e));
        }

        if scope != BackupScope::Full || self.ctx.coordinator.cleanup_started() {
            return;
        }

        report.stage = BackupStage::SnapshotVolumes;
        let volumes: Vec<_> = unit
            .volumes
            .iter()
            .filter(|v| !unit_config.skip_volumes.contains(&v.name))
            .cloned()
            .collect();
        if volumes.is_empty() {
            return;
        }

        let base = SnapshotTags {
            kind: SnapshotType::Volume,
            ..base_tags.clone()
        };
        let outcomes = snapshot_volumes(
            &self.ctx,
            &unit.name,
            &volumes,
            &base,
            &unit_config.excludes,
            self.ctx.config.effective_parallelism(),
        )
        .await;

        for outcome in &outcomes {
            if let Err(reason) = &outcome.result {
                report
                    .errors
                    .push(format!("volume {} failed: {}", outcome.volume, reason));
            }
        }
        report.volumes = outcomes;
    }

    async fn snapshot_recipes(
        &self,
        unit: &BackupUnit,
        base_tags: &SnapshotTags,
        report: &mut BackupReport,
    ) -> anyhow::Result<()> {
        let recipe_dir = self.ctx.staging.write_recipe(unit).await?;
        self.snapshot_dir(SnapshotType::Recipe, &recipe_dir, base_tags, report)
            .await?;

        if unit.containers.is_empty() {
            return Ok(());
        }
        let mut inspects: Vec<(String, Value)> = Vec::with_capacity(unit.containers.len());
        for container in &unit.containers {
            if self.ctx.coordinator.cleanup_started() {
                return Ok(());
            }
            match self.ctx.engine.inspect(&container.id).await {
                Ok(document) => inspects.push((container.name.clone(), document)),
                Err(e) => {
                    warn!(container = %container.name, "Inspect failed: {:#}", e);
                    report
                        .warnings
                        .push(format!("inspect {} failed: {:#}", container.name, e));
                }
            }
        }
        if self.ctx.coordinator.cleanup_started() {
            return Ok(());
        }
        let config_dir = self
            .ctx
            .staging
            .write_docker_config(&unit.name, &inspects)
            .await?;
        self.snapshot_dir(SnapshotType::DockerConfig, &config_dir, base_tags, report)
            .await
    }

    async fn snapshot_networks(
        &self,
        unit: &BackupUnit,
        base_tags: &SnapshotTags,
        report: &mut BackupReport,
    ) -> anyhow::Result<()> {
        let documents = self.ctx.engine.inspect_networks(&unit.networks).await?;
        let dir = self.ctx.staging.write_networks(&unit.name, &documents).await?;
        self.snapshot_dir(SnapshotType::Networks, &dir, base_tags, report)
            .await
    }

    async fn snapshot_dir(
        &self,
        kind: SnapshotType,
        dir: &Path,
        base_tags: &SnapshotTags,
        report: &mut BackupReport,
    ) -> anyhow::Result<()> {
        if self.ctx.coordinator.cleanup_started() {
            debug!(kind = %kind, "Interrupted, skipping snapshot");
            return Ok(());
        }
        let tags = SnapshotTags {
            kind,
            ..base_tags.clone()
        };
        let snapshot_id = self.ctx.snapshots.create_snapshot(dir, &tags, &[]).await?;
        info!(kind = %kind, snapshot = %snapshot_id, "Snapshot created");
        report.snapshots.push(SnapshotOutcome {
            kind,
            volume: None,
            snapshot_id,
            source: dir.display().to_string(),
        });
        Ok(())
    }

    /// Start everything still registered, last stopped first
    async fn start_containers(
        &self,
        unit: &BackupUnit,
        continuity: &ServiceContinuityHandler,
        report: &mut BackupReport,
    ) {
        let start_timeout = self.ctx.config.timeouts.start();
        for stopped in continuity.pending().into_iter().rev() {
            if self.ctx.coordinator.cleanup_started() {
                report.interrupted = true;
                return;
            }

            info!(container = %stopped.name, "Starting container");
            match tokio::time::timeout(start_timeout, self.ctx.engine.start(&stopped.id)).await {
                Ok(Ok(())) => report.restarted.push(stopped.name.clone()),
                Ok(Err(e)) => {
                    error!(container = %stopped.name, "Failed to start container: {:#}", e);
                    report
                        .errors
                        .push(format!("start {} failed: {:#}", stopped.name, e));
                }
                Err(_) => {
                    error!(container = %stopped.name, "Start timed out");
                    report.errors.push(format!(
                        "start {} timed out after {}s",
                        stopped.name,
                        start_timeout.as_secs()
                    ));
                }
            }
            continuity.unregister_container(&stopped.id);

            let declares_probe = unit
                .containers
                .iter()
                .find(|c| c.id == stopped.id)
                .is_some_and(|c| c.has_healthcheck);
            if declares_probe && report.restarted.contains(&stopped.name) {
                if let Some(warning) = self.wait_healthy(&stopped.id, &stopped.name).await {
                    report.warnings.push(warning);
                }
            }
        }
    }

    /// Poll the health probe; a probe that never turns healthy is a warning
    async fn wait_healthy(&self, id: &str, name: &str) -> Option<String> {
        let limit = self.ctx.config.timeouts.health();
        let deadline = Instant::now() + limit;
        loop {
            match self.ctx.engine.health_status(id).await {
                Ok(HealthStatus::Healthy) | Ok(HealthStatus::NoProbe) => {
                    debug!(container = %name, "Container healthy");
                    return None;
                }
                Ok(status) => debug!(container = %name, ?status, "Waiting for health probe"),
                Err(e) => debug!(container = %name, "Health query failed: {:#}", e),
            }

            if Instant::now() >= deadline || self.ctx.coordinator.cleanup_started() {
                warn!(container = %name, "Not healthy after {}s", limit.as_secs());
                return Some(format!(
                    "{} not healthy after {}s",
                    name,
                    limit.as_secs()
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(POLL_INTERVAL.min(remaining).max(Duration::from_millis(10))).await;
        }
    }

    async fn update_dr_bundle(&self, report: &BackupReport) -> anyhow::Result<()> {
        let config = &self.ctx.config;
        let Some(path) = config.dr_bundle.path.as_deref() else {
            return Ok(());
        };
        let connection =
            executor::backends::create_backend(&config.repository.backend).connection_args();
        let hostname = config.effective_hostname();
        dr_bundle::update(
            path,
            DrBundleUpdate {
                hostname: &hostname,
                repository_kind: config.repository.backend.kind(),
                repository: &connection.repository,
                password_file: &config.repository.password_file,
                unit: &report.unit,
                entry: DrUnitEntry {
                    backup_id: report.backup_id.clone(),
                    backed_up_at: report.started_at,
                    volumes: report
                        .volumes
                        .iter()
                        .filter(|v| v.result.is_ok())
                        .map(|v| v.volume.clone())
                        .collect(),
                },
            },
        )
        .await
    }
}
