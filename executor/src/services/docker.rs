use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::services::commands::{CommandRunner, CommandSpec};
use crate::types::{ContainerInfo, HealthStatus, MountInfo, NetworkSpec, VolumeInfo};

/// Networks docker creates itself; never backed up or recreated
pub const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

/// Container engine operations the pipelines rely on
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;
    /// Raw `docker inspect` document for one container
    async fn inspect(&self, id: &str) -> Result<Value>;
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>>;
    async fn create_volume(&self, name: &str) -> Result<()>;
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn health_status(&self, id: &str) -> Result<HealthStatus>;
    async fn list_networks(&self) -> Result<Vec<String>>;
    async fn inspect_networks(&self, names: &[String]) -> Result<Vec<Value>>;
    async fn network_exists(&self, name: &str) -> Result<bool>;
    async fn create_network(&self, spec: &NetworkSpec) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Command writing a tar of the volume's contents to stdout
    fn volume_archive_command(&self, volume: &str) -> CommandSpec;
    /// Command extracting a tar from stdin into the volume
    fn volume_extract_command(&self, volume: &str) -> CommandSpec;
    /// Command replacing the volume's contents with a host directory
    fn volume_import_command(&self, volume: &str, source: &Path) -> CommandSpec;
}

/// `docker` CLI implementation, every call through the command wrapper
pub struct DockerCli {
    runner: CommandRunner,
    helper_image: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(runner: CommandRunner, helper_image: &str, timeout: Duration) -> Self {
        Self {
            runner,
            helper_image: helper_image.to_string(),
            timeout,
        }
    }

    fn docker() -> CommandSpec {
        CommandSpec::new("docker")
    }

    /// Read-only calls are safe to retry
    async fn query(&self, spec: CommandSpec) -> Result<String> {
        let output = self
            .runner
            .run_with_retry(&spec, Some(self.timeout), 2)
            .await?;
        Ok(output.stdout)
    }

    /// Mutating calls run exactly once
    async fn mutate(&self, spec: CommandSpec, timeout: Duration) -> Result<()> {
        self.runner.run_checked(&spec, Some(timeout)).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let ids = self
            .query(Self::docker().args(["ps", "-aq", "--no-trunc"]).label("docker ps"))
            .await?;
        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw = self
            .query(Self::docker().arg("inspect").args(ids).label("docker inspect"))
            .await?;
        let documents: Vec<Value> =
            serde_json::from_str(&raw).context("Failed to parse docker inspect output")?;
        let containers: Vec<ContainerInfo> = documents.iter().filter_map(parse_container).collect();
        debug!("Found {} containers", containers.len());
        Ok(containers)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let names = self
            .query(Self::docker().args(["volume", "ls", "-q"]).label("docker volume ls"))
            .await?;
        let names: Vec<&str> = names.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let raw = self
            .query(
                Self::docker()
                    .args(["volume", "inspect"])
                    .args(names)
                    .label("docker volume inspect"),
            )
            .await?;
        let documents: Vec<Value> =
            serde_json::from_str(&raw).context("Failed to parse docker volume inspect output")?;
        Ok(documents.iter().filter_map(parse_volume).collect())
    }

    async fn inspect(&self, id: &str) -> Result<Value> {
        let raw = self
            .query(Self::docker().args(["inspect", id]).label("docker inspect"))
            .await?;
        let mut documents: Vec<Value> =
            serde_json::from_str(&raw).context("Failed to parse docker inspect output")?;
        if documents.is_empty() {
            return Err(anyhow!("Container {} not found", id));
        }
        Ok(documents.swap_remove(0))
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        let spec = Self::docker()
            .args(["volume", "inspect", name])
            .label("docker volume inspect");
        let output = self.runner.run(&spec, Some(self.timeout)).await?;
        if !output.success() {
            return Ok(None);
        }
        let documents: Vec<Value> = serde_json::from_str(&output.stdout)
            .context("Failed to parse docker volume inspect output")?;
        Ok(documents.iter().find_map(parse_volume))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        info!("Creating volume {}", name);
        self.mutate(
            Self::docker()
                .args(["volume", "create", name])
                .label("docker volume create"),
            self.timeout,
        )
        .await
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let spec = Self::docker()
            .args(["stop", "--time", &timeout.as_secs().to_string(), id])
            .label("docker stop");
        // docker itself waits `timeout` before killing; allow for that
        self.mutate(spec, timeout + self.timeout).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        // Restarting stopped containers is itself part of the cleanup pass
        let spec = Self::docker()
            .args(["start", id])
            .label("docker start")
            .during_cleanup();
        self.mutate(spec, self.timeout).await
    }

    async fn health_status(&self, id: &str) -> Result<HealthStatus> {
        let raw = self
            .query(
                Self::docker()
                    .args([
                        "inspect",
                        "--format",
                        "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
                        id,
                    ])
                    .label("docker inspect health"),
            )
            .await?;
        Ok(HealthStatus::parse(&raw))
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let raw = self
            .query(
                Self::docker()
                    .args(["network", "ls", "--format", "{{.Name}}"])
                    .label("docker network ls"),
            )
            .await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn inspect_networks(&self, names: &[String]) -> Result<Vec<Value>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self
            .query(
                Self::docker()
                    .args(["network", "inspect"])
                    .args(names.iter().cloned())
                    .label("docker network inspect"),
            )
            .await?;
        serde_json::from_str(&raw).context("Failed to parse docker network inspect output")
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let spec = Self::docker()
            .args(["network", "inspect", name])
            .label("docker network inspect");
        let output = self.runner.run(&spec, Some(self.timeout)).await?;
        Ok(output.success())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        info!("Creating network {}", spec.name);
        self.mutate(network_create_command(spec), self.timeout).await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        info!("Removing network {}", name);
        self.mutate(
            Self::docker()
                .args(["network", "rm", name])
                .label("docker network rm"),
            self.timeout,
        )
        .await
    }

    fn volume_archive_command(&self, volume: &str) -> CommandSpec {
        Self::docker()
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:/data:ro", volume))
            .args([self.helper_image.as_str(), "tar", "-C", "/data", "-cf", "-", "."])
            .label("docker run tar (archive)")
    }

    fn volume_extract_command(&self, volume: &str) -> CommandSpec {
        Self::docker()
            .args(["run", "--rm", "-i", "-v"])
            .arg(format!("{}:/data", volume))
            .args([self.helper_image.as_str(), "tar", "-C", "/data", "-xf", "-"])
            .label("docker run tar (extract)")
    }

    fn volume_import_command(&self, volume: &str, source: &Path) -> CommandSpec {
        Self::docker()
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:/data", volume))
            .arg("-v")
            .arg(format!("{}:/restore:ro", source.display()))
            .args([
                self.helper_image.as_str(),
                "sh",
                "-c",
                "find /data -mindepth 1 -delete && cp -a /restore/. /data/",
            ])
            .label("docker run cp (import)")
    }
}

pub fn network_create_command(spec: &NetworkSpec) -> CommandSpec {
    let mut command = CommandSpec::new("docker")
        .args(["network", "create", "--driver", spec.driver.as_str()])
        .label("docker network create");
    for subnet in &spec.subnets {
        command = command.arg("--subnet").arg(subnet.as_str());
    }
    for gateway in &spec.gateways {
        command = command.arg("--gateway").arg(gateway.as_str());
    }
    if spec.internal {
        command = command.arg("--internal");
    }
    if spec.attachable {
        command = command.arg("--attachable");
    }
    for (key, value) in &spec.labels {
        command = command.arg("--label").arg(format!("{}={}", key, value));
    }
    command.arg(spec.name.as_str())
}

/// Build a container summary from one `docker inspect` document
pub fn parse_container(doc: &Value) -> Option<ContainerInfo> {
    let id = doc.get("Id")?.as_str()?.to_string();
    let name = doc
        .get("Name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let config = doc.get("Config");
    let image = config
        .and_then(|c| c.get("Image"))
        .and_then(|i| i.as_str())
        .unwrap_or_default()
        .to_string();
    let running = doc
        .get("State")
        .and_then(|s| s.get("Running"))
        .and_then(|r| r.as_bool())
        .unwrap_or(false);
    let labels = string_map(config.and_then(|c| c.get("Labels")));

    let mounts = doc
        .get("Mounts")
        .and_then(|m| m.as_array())
        .map(|mounts| mounts.iter().map(parse_mount).collect())
        .unwrap_or_default();

    let mut networks: Vec<String> = doc
        .get("NetworkSettings")
        .and_then(|n| n.get("Networks"))
        .and_then(|n| n.as_object())
        .map(|n| n.keys().cloned().collect())
        .unwrap_or_default();
    networks.sort();

    // A Healthcheck of ["NONE"] explicitly disables an image-level probe
    let has_healthcheck = config
        .and_then(|c| c.get("Healthcheck"))
        .and_then(|h| h.get("Test"))
        .and_then(|t| t.as_array())
        .map(|test| {
            !test.is_empty() && test.first().and_then(|t| t.as_str()) != Some("NONE")
        })
        .unwrap_or(false);

    Some(ContainerInfo {
        id,
        name,
        image,
        running,
        labels,
        mounts,
        networks,
        has_healthcheck,
    })
}

fn parse_mount(mount: &Value) -> MountInfo {
    let field = |key: &str| mount.get(key).and_then(|v| v.as_str()).map(str::to_string);
    MountInfo {
        kind: field("Type").unwrap_or_else(|| "bind".to_string()),
        name: field("Name"),
        source: field("Source").unwrap_or_default(),
        destination: field("Destination").unwrap_or_default(),
        driver: field("Driver"),
    }
}

pub fn parse_volume(doc: &Value) -> Option<VolumeInfo> {
    let name = doc.get("Name")?.as_str()?.to_string();
    Some(VolumeInfo {
        name,
        driver: doc
            .get("Driver")
            .and_then(|d| d.as_str())
            .unwrap_or("local")
            .to_string(),
        mountpoint: doc
            .get("Mountpoint")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .map(PathBuf::from),
        labels: string_map(doc.get("Labels")),
    })
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
