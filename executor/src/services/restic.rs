use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backends::ConnectionArgs;
use crate::errors::VaultError;
use crate::services::commands::{CommandOutput, CommandRunner, CommandSpec};
use crate::types::{RetentionPolicy, SnapshotFilter, SnapshotRecord, SnapshotTags};

/// restic exit code for "snapshot created, some files unreadable"
const RESTIC_INCOMPLETE_SNAPSHOT: i32 = 3;

/// restic exit code when the repository does not exist
const RESTIC_REPO_MISSING: i32 = 10;

/// Snapshot engine operations the pipelines rely on
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Snapshot a host path, returning the snapshot id
    async fn create_snapshot(
        &self,
        path: &Path,
        tags: &SnapshotTags,
        excludes: &[String],
    ) -> Result<String>;

    /// Snapshot the stdout of `producer`, stored under `virtual_path`
    async fn create_snapshot_from_stream(
        &self,
        producer: &CommandSpec,
        virtual_path: &str,
        tags: &SnapshotTags,
    ) -> Result<String>;

    async fn list_snapshots(&self, filter: Option<&SnapshotFilter>) -> Result<Vec<SnapshotRecord>>;

    async fn restore_snapshot(&self, id: &str, target: &Path) -> Result<()>;

    /// Stream one file of a snapshot into the stdin of `consumer`
    async fn dump_snapshot_to(&self, id: &str, path: &str, consumer: &CommandSpec) -> Result<()>;

    async fn apply_retention_policy(&self, path: &Path, policy: &RetentionPolicy) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResticTimeouts {
    pub snapshot: Duration,
    pub query: Duration,
}

/// `restic` CLI implementation
pub struct ResticCli {
    runner: CommandRunner,
    connection: ConnectionArgs,
    password_file: PathBuf,
    hostname: String,
    timeouts: ResticTimeouts,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    #[serde(default)]
    short_id: Option<String>,
    time: DateTime<Utc>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl ResticCli {
    pub fn new(
        runner: CommandRunner,
        connection: ConnectionArgs,
        password_file: &Path,
        hostname: &str,
        timeouts: ResticTimeouts,
    ) -> Self {
        Self {
            runner,
            connection,
            password_file: password_file.to_path_buf(),
            hostname: hostname.to_string(),
            timeouts,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn restic(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new("restic")
            .args(["--repo", self.connection.repository.as_str()])
            .args(self.connection.extra_args.iter().cloned())
            .env(
                "RESTIC_PASSWORD_FILE",
                &self.password_file.display().to_string(),
            )
            .envs(&self.connection.env)
            .arg(subcommand)
            .label(&format!("restic {}", subcommand))
    }

    fn tag_args(tags: &SnapshotTags) -> Vec<String> {
        tags.to_tag_list()
            .into_iter()
            .flat_map(|tag| ["--tag".to_string(), tag])
            .collect()
    }

    fn snapshot_id(output: CommandOutput, label: &str) -> Result<String> {
        if output.exit_code == RESTIC_INCOMPLETE_SNAPSHOT {
            warn!("{} finished with unreadable files: {}", label, output.stderr.trim());
        } else if !output.success() {
            return Err(VaultError::ExternalTool(crate::errors::ExternalToolError {
                label: label.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().chars().take(500).collect(),
            })
            .into());
        }
        parse_backup_summary(&output.stdout)
            .ok_or_else(|| anyhow!("{} did not report a snapshot id", label))
    }

    /// Create the repository when it does not exist yet
    pub async fn init_repository_if_missing(&self) -> Result<bool> {
        let probe = self.restic("cat").arg("config");
        let output = self.runner.run(&probe, Some(self.timeouts.query)).await?;
        if output.success() {
            return Ok(false);
        }
        if output.exit_code != RESTIC_REPO_MISSING && !output.stderr.contains("does not exist") {
            return Err(anyhow!(
                "Repository {} is not accessible: {}",
                self.connection.repository,
                output.stderr.trim()
            ));
        }
        info!(repository = %self.connection.repository, "Initialising repository");
        self.runner
            .run_checked(&self.restic("init"), Some(self.timeouts.query))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl SnapshotEngine for ResticCli {
    async fn create_snapshot(
        &self,
        path: &Path,
        tags: &SnapshotTags,
        excludes: &[String],
    ) -> Result<String> {
        let mut spec = self
            .restic("backup")
            .args(["--json", "--host", self.hostname.as_str()])
            .args(Self::tag_args(tags));
        for pattern in excludes {
            spec = spec.arg("--exclude").arg(pattern.as_str());
        }
        let spec = spec.arg(path.display().to_string());

        debug!(path = %path.display(), unit = %tags.unit, "Creating snapshot");
        let output = self.runner.run(&spec, Some(self.timeouts.snapshot)).await?;
        Self::snapshot_id(output, "restic backup")
    }

    async fn create_snapshot_from_stream(
        &self,
        producer: &CommandSpec,
        virtual_path: &str,
        tags: &SnapshotTags,
    ) -> Result<String> {
        let consumer = self
            .restic("backup")
            .args(["--json", "--host", self.hostname.as_str()])
            .args(Self::tag_args(tags))
            .args(["--stdin", "--stdin-filename", virtual_path]);

        debug!(virtual_path, unit = %tags.unit, "Creating snapshot from stream");
        let output = self
            .runner
            .run_piped(producer, &consumer, Some(self.timeouts.snapshot))
            .await?;
        Self::snapshot_id(output, "restic backup --stdin")
    }

    async fn list_snapshots(&self, filter: Option<&SnapshotFilter>) -> Result<Vec<SnapshotRecord>> {
        let mut spec = self.restic("snapshots").arg("--json");
        if let Some(filter) = filter {
            if !filter.tags.is_empty() {
                spec = spec.arg("--tag").arg(filter.tags.join(","));
            }
            if let Some(host) = &filter.host {
                spec = spec.arg("--host").arg(host.as_str());
            }
        }

        let output = self
            .runner
            .run_with_retry(&spec, Some(self.timeouts.query), 3)
            .await?;
        let records = parse_snapshots(&output.stdout)?;
        Ok(match filter {
            Some(filter) => records.into_iter().filter(|r| filter.matches(r)).collect(),
            None => records,
        })
    }

    async fn restore_snapshot(&self, id: &str, target: &Path) -> Result<()> {
        let spec = self
            .restic("restore")
            .arg(id)
            .arg("--target")
            .arg(target.display().to_string());
        info!(snapshot = id, target = %target.display(), "Restoring snapshot");
        self.runner
            .run_checked(&spec, Some(self.timeouts.snapshot))
            .await?;
        Ok(())
    }

    async fn dump_snapshot_to(&self, id: &str, path: &str, consumer: &CommandSpec) -> Result<()> {
        let producer = self.restic("dump").arg(id).arg(path);
        info!(snapshot = id, path, "Streaming snapshot content");
        let output = self
            .runner
            .run_piped(&producer, consumer, Some(self.timeouts.snapshot))
            .await?;
        if !output.success() {
            return Err(anyhow!(
                "{} failed with exit code {}: {}",
                consumer.display_label(),
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(())
    }

    async fn apply_retention_policy(&self, path: &Path, policy: &RetentionPolicy) -> Result<()> {
        if policy.is_empty() {
            debug!(path = %path.display(), "No retention policy configured");
            return Ok(());
        }
        let mut spec = self
            .restic("forget")
            .args(["--host", self.hostname.as_str()])
            .arg("--path")
            .arg(path.display().to_string())
            .args(policy.to_args());
        if policy.prune {
            spec = spec.arg("--prune");
        }
        info!(path = %path.display(), "Applying retention policy");
        self.runner
            .run_checked(&spec, Some(self.timeouts.snapshot))
            .await
            .with_context(|| format!("Retention for {} failed", path.display()))?;
        Ok(())
    }
}

/// Snapshot id from the summary line of `restic backup --json`
pub fn parse_backup_summary(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .filter(|value| value.get("message_type").and_then(|m| m.as_str()) == Some("summary"))
        .find_map(|value| {
            value
                .get("snapshot_id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
        })
}

/// Records from `restic snapshots --json`; snapshots not created by us are skipped
pub fn parse_snapshots(json: &str) -> Result<Vec<SnapshotRecord>> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let raw: Vec<RawSnapshot> =
        serde_json::from_str(trimmed).context("Failed to parse restic snapshots output")?;

    Ok(raw
        .into_iter()
        .filter_map(|snapshot| {
            let tags = SnapshotTags::from_tag_list(&snapshot.tags.unwrap_or_default())?;
            let short_id = snapshot
                .short_id
                .unwrap_or_else(|| snapshot.id.chars().take(8).collect());
            Some(SnapshotRecord {
                id: snapshot.id,
                short_id,
                time: snapshot.time,
                hostname: snapshot.hostname,
                paths: snapshot.paths,
                tags,
            })
        })
        .collect())
}
