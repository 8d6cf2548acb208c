//! Scripted container engine
//!
//! Containers, volumes and networks are plain in-memory state. Every
//! mutating call is appended to an event log so tests can assert ordering.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use executor::services::docker::ContainerEngine;
use executor::types::{
    BackupUnit, ContainerInfo, ContainerRef, HealthStatus, MountInfo, NetworkSpec, UnitKind,
    VolumeInfo, VolumeRef,
};
use executor::{CommandRunner, CommandSpec};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockEngine {
    containers: Mutex<Vec<ContainerInfo>>,
    volumes: Mutex<Vec<VolumeInfo>>,
    networks: Mutex<BTreeSet<String>>,
    events: Mutex<Vec<String>>,
    fail_stop: Mutex<Option<String>>,
    inspected: Mutex<Vec<String>>,
    slow_inspect: Option<CommandRunner>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Running compose container mounting `volumes`, attached to `networks`
    pub fn with_container(self, project: &str, id: &str, name: &str, volumes: &[&str], networks: &[&str]) -> Self {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.project".to_string(), project.to_string());
        let mounts = volumes
            .iter()
            .map(|v| MountInfo {
                kind: "volume".to_string(),
                name: Some(v.to_string()),
                source: format!("/var/lib/docker/volumes/{}/_data", v),
                destination: "/data".to_string(),
                driver: Some("local".to_string()),
            })
            .collect();
        self.containers.lock().unwrap().push(ContainerInfo {
            id: id.to_string(),
            name: name.to_string(),
            image: "alpine:3".to_string(),
            running: true,
            labels,
            mounts,
            networks: networks.iter().map(|n| n.to_string()).collect(),
            has_healthcheck: false,
        });
        self
    }

    pub fn with_volume(self, name: &str, mountpoint: Option<&Path>) -> Self {
        self.volumes.lock().unwrap().push(VolumeInfo {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: mountpoint.map(Path::to_path_buf),
            labels: HashMap::new(),
        });
        self
    }

    pub fn with_network(self, name: &str) -> Self {
        self.networks.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn fail_stop_of(self, id: &str) -> Self {
        *self.fail_stop.lock().unwrap() = Some(id.to_string());
        self
    }

    /// Each container inspect runs a tracked `sleep 3` through `runner`
    pub fn with_slow_inspect(mut self, runner: CommandRunner) -> Self {
        self.slow_inspect = Some(runner);
        self
    }

    /// Container ids in the order they were inspected
    pub fn inspected(&self) -> Vec<String> {
        self.inspected.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn events_with(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.events_with("start:")
    }

    pub fn stopped(&self) -> Vec<String> {
        self.events_with("stop:")
    }

    pub fn created_networks(&self) -> Vec<String> {
        self.events_with("network-create:")
    }

    pub fn network_names(&self) -> BTreeSet<String> {
        self.networks.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self.volumes.lock().unwrap().clone())
    }

    async fn inspect(&self, id: &str) -> Result<Value> {
        self.inspected.lock().unwrap().push(id.to_string());
        if let Some(runner) = &self.slow_inspect {
            runner
                .run_checked(&CommandSpec::new("sleep").arg("3").label("docker inspect"), None)
                .await?;
        }
        Ok(json!({
            "Id": id,
            "Config": { "Env": ["APP_MODE=prod", "DB_PASSWORD=hunter2"] }
        }))
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.name == name)
            .cloned())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.record(format!("volume-create:{}", name));
        self.volumes.lock().unwrap().push(VolumeInfo {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: None,
            labels: HashMap::new(),
        });
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop:{}", id));
        if self.fail_stop.lock().unwrap().as_deref() == Some(id) {
            return Err(anyhow!("container {} did not stop", id));
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start:{}", id));
        Ok(())
    }

    async fn health_status(&self, _id: &str) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.networks.lock().unwrap().iter().cloned().collect())
    }

    async fn inspect_networks(&self, names: &[String]) -> Result<Vec<Value>> {
        Ok(names
            .iter()
            .map(|name| {
                json!({
                    "Name": name,
                    "Driver": "bridge",
                    "Internal": false,
                    "Attachable": false,
                    "IPAM": { "Config": [{ "Subnet": "172.30.0.0/24", "Gateway": "172.30.0.1" }] },
                    "Labels": {}
                })
            })
            .collect())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.networks.lock().unwrap().contains(name))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.record(format!("network-create:{}", spec.name));
        self.networks.lock().unwrap().insert(spec.name.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record(format!("network-rm:{}", name));
        self.networks.lock().unwrap().remove(name);
        Ok(())
    }

    fn volume_archive_command(&self, volume: &str) -> CommandSpec {
        CommandSpec::shell(&format!("printf 'archive of {}'", volume)).label("mock archive")
    }

    fn volume_extract_command(&self, _volume: &str) -> CommandSpec {
        CommandSpec::shell("cat > /dev/null").label("mock extract")
    }

    fn volume_import_command(&self, _volume: &str, source: &Path) -> CommandSpec {
        CommandSpec::shell(&format!("test -d '{}'", source.display())).label("mock import")
    }
}

/// The "demo" stack: two containers sharing one volume and one network
pub fn demo_unit(mountpoint: Option<PathBuf>) -> BackupUnit {
    BackupUnit {
        name: "demo".to_string(),
        kind: UnitKind::Stack,
        containers: vec![
            ContainerRef {
                id: "id-db".to_string(),
                name: "demo-db-1".to_string(),
                has_healthcheck: false,
                running: true,
            },
            ContainerRef {
                id: "id-web".to_string(),
                name: "demo-web-1".to_string(),
                has_healthcheck: true,
                running: true,
            },
        ],
        volumes: vec![VolumeRef {
            name: "demo_data".to_string(),
            driver: "local".to_string(),
            mountpoint,
        }],
        networks: vec!["demo_default".to_string()],
        compose_files: vec![],
        working_dir: None,
    }
}
