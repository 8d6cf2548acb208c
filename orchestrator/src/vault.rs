//! Entry points used by the CLI and by embedding code
//!
//! `Vault` wires the pipelines to one shared coordinator, a run tracker and a
//! notification sink. Construct it once per process after the coordinator's
//! signal handlers are installed.

use anyhow::{Context, Result};
use chrono::Utc;
use executor::backends::{create_backend, find_binary};
use executor::errors::{PreconditionError, VaultError};
use executor::exit_safety::ExitSafety;
use executor::services::docker::DockerCli;
use executor::services::restic::{ResticCli, ResticTimeouts};
use executor::types::{BackupScope, BackupUnit, SnapshotFilter};
use executor::CommandRunner;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::backup::{BackupPipeline, BackupReport, BackupStage};
use crate::config::Config;
use crate::constants::parallelism::UNITS_IN_FLIGHT;
use crate::context::PipelineContext;
use crate::discovery;
use crate::restore::{
    group_sessions, host_summaries, ConflictPolicy, ConflictPrompt, HostSummary, RestorePipeline,
    RestoreReport, RestoreSelection, RestoreSession,
};
use crate::run_tracker::RunTracker;
use crate::services::{NoopNotifier, NotificationSink, RunStats, UnitStats, WebhookNotifier};

pub struct Vault {
    ctx: PipelineContext,
    tracker: RunTracker,
    notifier: Arc<dyn NotificationSink>,
    restic: Option<Arc<ResticCli>>,
}

impl Vault {
    pub fn new(ctx: PipelineContext, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            ctx,
            tracker: RunTracker::new(),
            notifier,
            restic: None,
        }
    }

    /// Build the docker and restic clients described by `config`
    pub fn from_config(config: Arc<Config>, coordinator: Arc<ExitSafety>) -> Result<Self> {
        let runner = CommandRunner::new(coordinator.clone(), config.timeouts.command());
        let engine = Arc::new(DockerCli::new(
            runner.clone(),
            &config.helper_image,
            config.timeouts.command(),
        ));

        let backend = create_backend(&config.repository.backend);
        let restic = Arc::new(ResticCli::new(
            runner,
            backend.connection_args(),
            &config.repository.password_file,
            &config.effective_hostname(),
            ResticTimeouts {
                snapshot: config.timeouts.snapshot(),
                query: config.timeouts.command(),
            },
        ));

        let notifier: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(
                url,
                config.notifications.timeout_seconds,
                config.notifications.notify_on_success,
            )?),
            None => Arc::new(NoopNotifier),
        };

        let ctx = PipelineContext::new(coordinator, engine, restic.clone(), config);
        let mut vault = Self::new(ctx, notifier);
        vault.restic = Some(restic);
        Ok(vault)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub async fn discover(&self) -> Result<Vec<BackupUnit>> {
        discovery::discover(self.ctx.engine.as_ref(), &self.ctx.config.exclude_units).await
    }

    /// Back up one unit; fails only when the unit is already busy
    pub async fn run_backup(&self, unit: &BackupUnit, scope: BackupScope) -> Result<BackupReport, VaultError> {
        self.tracker
            .try_start(&unit.name, &format!("backup ({})", scope.as_str()))
            .await?;
        let report = BackupPipeline::new(self.ctx.clone()).run(unit, scope).await;
        self.tracker.finish(&unit.name).await;
        Ok(report)
    }

    /// Back up the named units, or every discovered unit when `names` is
    /// empty. Unknown names fail the whole run before anything is touched.
    #[instrument(skip(self, names), fields(scope = scope.as_str()))]
    pub async fn run_backups(&self, names: &[String], scope: BackupScope) -> Result<Vec<BackupReport>> {
        let discovered = self.discover().await?;
        let units: Vec<BackupUnit> = if names.is_empty() {
            discovered
        } else {
            let mut selected = Vec::with_capacity(names.len());
            for name in names {
                let unit = discovered
                    .iter()
                    .find(|u| &u.name == name)
                    .cloned()
                    .ok_or_else(|| PreconditionError::UnknownUnit { unit: name.clone() })?;
                if !selected.iter().any(|u: &BackupUnit| u.name == unit.name) {
                    selected.push(unit);
                }
            }
            selected
        };

        info!(units = units.len(), "Starting backup run");
        let tasks: Vec<_> = units
            .into_iter()
            .map(|unit| async move {
                if self.ctx.coordinator.cleanup_started() {
                    return not_started(&unit, scope, "interrupted before start".to_string());
                }
                match self.run_backup(&unit, scope).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(unit = %unit.name, "Backup not started: {}", e);
                        not_started(&unit, scope, e.to_string())
                    }
                }
            })
            .collect();
        let reports: Vec<BackupReport> = stream::iter(tasks)
            .buffer_unordered(UNITS_IN_FLIGHT)
            .collect()
            .await;

        let mut reports = reports;
        reports.sort_by(|a, b| a.unit.cmp(&b.unit));
        self.notify_backups(&reports).await;
        Ok(reports)
    }

    async fn notify_backups(&self, reports: &[BackupReport]) {
        let stats = RunStats {
            operation: "backup".to_string(),
            host: self.ctx.config.effective_hostname(),
            interrupted: reports.iter().any(|r| r.interrupted),
            units: reports
                .iter()
                .map(|r| UnitStats {
                    unit: r.unit.clone(),
                    success: r.success(),
                    backup_id: Some(r.backup_id.clone()),
                    errors: r.errors.clone(),
                })
                .collect(),
        };
        let success = reports.iter().all(BackupReport::success);
        self.notifier.notify(success, &stats).await;
    }

    /// Sessions in the repository, newest first
    pub async fn list_restore_sessions(
        &self,
        unit: Option<&str>,
        host: Option<&str>,
    ) -> Result<Vec<RestoreSession>> {
        let mut filter = match unit {
            Some(unit) => SnapshotFilter::for_unit(unit),
            None => SnapshotFilter::default(),
        };
        if let Some(host) = host {
            filter = filter.with_host(host);
        }
        let records = self.ctx.snapshots.list_snapshots(Some(&filter)).await?;
        Ok(group_sessions(records))
    }

    pub async fn find_session(&self, unit: &str, backup_id: &str) -> Result<RestoreSession> {
        self.list_restore_sessions(Some(unit), None)
            .await?
            .into_iter()
            .find(|s| s.backup_id == backup_id)
            .with_context(|| format!("No backup {} found for unit {}", backup_id, unit))
    }

    pub async fn host_summaries(&self) -> Result<Vec<HostSummary>> {
        let records = self.ctx.snapshots.list_snapshots(None).await?;
        Ok(host_summaries(&records))
    }

    /// Replay `session`; `policy` overrides the configured conflict policy
    pub async fn run_restore(
        &self,
        session: &RestoreSession,
        selection: &RestoreSelection,
        policy: Option<ConflictPolicy>,
        prompt: &dyn ConflictPrompt,
    ) -> Result<RestoreReport, VaultError> {
        let policy = policy.unwrap_or(self.ctx.config.restore.conflict_policy);
        self.tracker
            .try_start(&session.unit, &format!("restore {}", session.backup_id))
            .await?;
        let report = RestorePipeline::new(self.ctx.clone())
            .run(session, selection, policy, prompt)
            .await;
        self.tracker.finish(&session.unit).await;

        let stats = RunStats {
            operation: "restore".to_string(),
            host: self.ctx.config.effective_hostname(),
            interrupted: report.interrupted,
            units: vec![UnitStats {
                unit: report.unit.clone(),
                success: report.success(),
                backup_id: Some(report.backup_id.clone()),
                errors: report.errors.clone(),
            }],
        };
        self.notifier.notify(report.success(), &stats).await;
        Ok(report)
    }

    /// Dependencies, backend reachability and repository initialisation
    pub async fn check(&self) -> Result<Vec<String>, VaultError> {
        let mut lines = Vec::new();
        let config = &self.ctx.config;

        if find_binary("docker").is_none() {
            return Err(PreconditionError::MissingDependency {
                tool: "docker".to_string(),
            }
            .into());
        }
        lines.push("docker found".to_string());

        let backend = create_backend(&config.repository.backend);
        backend.check_dependencies()?;
        lines.push(format!("{} backend dependencies found", backend.name()));
        backend.validate_config()?;
        backend.test_connection(&self.ctx.runner).await?;
        lines.push(format!(
            "{} backend reachable at {}",
            backend.name(),
            backend.connection_args().repository
        ));

        if !config.repository.password_file.exists() {
            return Err(VaultError::Other(format!(
                "Password file {} does not exist",
                config.repository.password_file.display()
            )));
        }

        if let Some(restic) = &self.restic {
            let created = restic
                .init_repository_if_missing()
                .await
                .map_err(|e| VaultError::Other(format!("{:#}", e)))?;
            lines.push(if created {
                "repository initialised".to_string()
            } else {
                "repository ready".to_string()
            });
        }
        Ok(lines)
    }
}

fn not_started(unit: &BackupUnit, scope: BackupScope, reason: String) -> BackupReport {
    let now = Utc::now();
    let mut report = BackupReport::new(&unit.name, "-", scope, now);
    report.errors.push(reason.clone());
    report.stage = BackupStage::Aborted(reason);
    report.finished_at = Some(now);
    report
}
