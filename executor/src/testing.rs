//! In-crate test double for the container engine

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::services::commands::CommandSpec;
use crate::services::docker::ContainerEngine;
use crate::types::{ContainerInfo, HealthStatus, NetworkSpec, VolumeInfo};

#[derive(Default)]
pub struct RecordingEngine {
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    fail_start: Option<String>,
}

impl RecordingEngine {
    pub fn failing_start(id: &str) -> Self {
        Self {
            fail_start: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(Vec::new())
    }

    async fn inspect(&self, id: &str) -> Result<Value> {
        Ok(serde_json::json!({ "Id": id }))
    }

    async fn inspect_volume(&self, _name: &str) -> Result<Option<VolumeInfo>> {
        Ok(None)
    }

    async fn create_volume(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.started.lock().unwrap().push(id.to_string());
        if self.fail_start.as_deref() == Some(id) {
            return Err(anyhow!("container {} refused to start", id));
        }
        Ok(())
    }

    async fn health_status(&self, _id: &str) -> Result<HealthStatus> {
        Ok(HealthStatus::NoProbe)
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn inspect_networks(&self, _names: &[String]) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn network_exists(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn create_network(&self, _spec: &NetworkSpec) -> Result<()> {
        Ok(())
    }

    async fn remove_network(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn volume_archive_command(&self, _volume: &str) -> CommandSpec {
        CommandSpec::shell("printf data")
    }

    fn volume_extract_command(&self, _volume: &str) -> CommandSpec {
        CommandSpec::new("cat")
    }

    fn volume_import_command(&self, _volume: &str, _source: &Path) -> CommandSpec {
        CommandSpec::new("true")
    }
}
