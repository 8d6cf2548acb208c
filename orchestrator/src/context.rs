use executor::exit_safety::ExitSafety;
use executor::services::docker::ContainerEngine;
use executor::services::hooks::HookRunner;
use executor::services::restic::SnapshotEngine;
use executor::CommandRunner;
use std::sync::Arc;

use crate::config::Config;
use crate::staging::StagingLayout;

/// Collaborators shared by the backup and restore pipelines
#[derive(Clone)]
pub struct PipelineContext {
    pub coordinator: Arc<ExitSafety>,
    pub runner: CommandRunner,
    pub engine: Arc<dyn ContainerEngine>,
    pub snapshots: Arc<dyn SnapshotEngine>,
    pub hooks: HookRunner,
    pub config: Arc<Config>,
    pub staging: StagingLayout,
}

impl PipelineContext {
    pub fn new(
        coordinator: Arc<ExitSafety>,
        engine: Arc<dyn ContainerEngine>,
        snapshots: Arc<dyn SnapshotEngine>,
        config: Arc<Config>,
    ) -> Self {
        let runner = CommandRunner::new(coordinator.clone(), config.timeouts.command());
        Self {
            hooks: HookRunner::new(runner.clone()),
            staging: StagingLayout::new(&config.staging_root),
            coordinator,
            runner,
            engine,
            snapshots,
            config,
        }
    }
}
