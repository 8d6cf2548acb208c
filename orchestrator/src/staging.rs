//! Stable per-unit staging directories for recipe, docker_config and
//! networks snapshots
//!
//! Retention is keyed on snapshot source paths, so these paths must be the
//! same on every run of a unit: `<staging_root>/<unit>/<kind>`. Each run
//! clears and rewrites the directory contents instead of creating a new one.

use anyhow::{Context, Result};
use executor::types::BackupUnit;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::constants::redaction;

pub const RECIPE_DIR: &str = "recipe";
pub const DOCKER_CONFIG_DIR: &str = "docker_config";
pub const NETWORKS_DIR: &str = "networks";
pub const NETWORKS_FILE: &str = "networks.json";
pub const UNIT_MANIFEST_FILE: &str = "unit.json";

#[derive(Debug, Clone)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn unit_dir(&self, unit: &str) -> PathBuf {
        self.root.join(sanitize(unit))
    }

    pub fn recipe_dir(&self, unit: &str) -> PathBuf {
        self.unit_dir(unit).join(RECIPE_DIR)
    }

    pub fn docker_config_dir(&self, unit: &str) -> PathBuf {
        self.unit_dir(unit).join(DOCKER_CONFIG_DIR)
    }

    pub fn networks_dir(&self, unit: &str) -> PathBuf {
        self.unit_dir(unit).join(NETWORKS_DIR)
    }

    /// Every stable source path of a unit, used for retention
    pub fn source_paths(&self, unit: &str) -> Vec<PathBuf> {
        vec![
            self.recipe_dir(unit),
            self.docker_config_dir(unit),
            self.networks_dir(unit),
        ]
    }

    /// Write compose files, a redacted `.env` and a unit manifest
    pub async fn write_recipe(&self, unit: &BackupUnit) -> Result<PathBuf> {
        let dir = self.recipe_dir(&unit.name);
        reset_dir(&dir).await?;

        for compose_file in &unit.compose_files {
            let Some(file_name) = compose_file.file_name() else {
                continue;
            };
            match fs::read_to_string(compose_file).await {
                Ok(content) => {
                    fs::write(dir.join(file_name), redact_text(&content)).await?;
                }
                Err(e) => {
                    warn!(unit = %unit.name, file = %compose_file.display(), "Compose file not readable: {}", e);
                }
            }
        }

        if let Some(working_dir) = &unit.working_dir {
            let env_file = working_dir.join(".env");
            if let Ok(content) = fs::read_to_string(&env_file).await {
                fs::write(dir.join(".env"), redact_text(&content)).await?;
            }
        }

        let manifest = serde_json::to_string_pretty(unit)?;
        fs::write(dir.join(UNIT_MANIFEST_FILE), manifest).await?;
        debug!(unit = %unit.name, dir = %dir.display(), "Recipe staged");
        Ok(dir)
    }

    /// Write one redacted inspect document per container
    pub async fn write_docker_config(
        &self,
        unit: &str,
        inspects: &[(String, Value)],
    ) -> Result<PathBuf> {
        let dir = self.docker_config_dir(unit);
        reset_dir(&dir).await?;
        for (container, document) in inspects {
            let redacted = redact_inspect(document.clone());
            let path = dir.join(format!("{}.json", sanitize(container)));
            fs::write(&path, serde_json::to_string_pretty(&redacted)?).await?;
        }
        Ok(dir)
    }

    pub async fn write_networks(&self, unit: &str, networks: &[Value]) -> Result<PathBuf> {
        let dir = self.networks_dir(unit);
        reset_dir(&dir).await?;
        fs::write(
            dir.join(NETWORKS_FILE),
            serde_json::to_string_pretty(networks)?,
        )
        .await?;
        Ok(dir)
    }
}

/// Empty `dir`, creating it when missing; the path itself never changes
async fn reset_dir(dir: &Path) -> Result<()> {
    if fs::try_exists(dir).await.unwrap_or(false) {
        fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))
}

pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect()
}

pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    redaction::SENSITIVE_KEY_PARTS
        .iter()
        .any(|part| upper.contains(part))
}

/// Redact `KEY=value` (env, `- KEY=value` lists) and `KEY: value` (YAML maps)
pub fn redact_line(line: &str) -> String {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    if trimmed.starts_with('#') {
        return line.to_string();
    }

    let (prefix, body) = match trimmed.strip_prefix("- ") {
        Some(rest) => ("- ", rest),
        None => match trimmed.strip_prefix("export ") {
            Some(rest) => ("export ", rest),
            None => ("", trimmed),
        },
    };

    let separator = match (body.find('='), body.find(':')) {
        (Some(eq), Some(colon)) => Some(eq.min(colon)),
        (Some(eq), None) => Some(eq),
        (None, Some(colon)) => Some(colon),
        (None, None) => None,
    };
    let Some(at) = separator else {
        return line.to_string();
    };

    let key = body[..at].trim().trim_matches('"').trim_matches('\'');
    let value = body[at + 1..].trim();
    if key.is_empty() || value.is_empty() || key.contains(' ') || !is_sensitive_key(key) {
        return line.to_string();
    }

    let sep = &body[at..at + 1];
    let spacing = if sep == ":" { " " } else { "" };
    format!(
        "{}{}{}{}{}{}",
        indent,
        prefix,
        &body[..at],
        sep,
        spacing,
        redaction::MARKER
    )
}

pub fn redact_text(content: &str) -> String {
    let mut redacted: Vec<String> = content.lines().map(redact_line).collect();
    if content.ends_with('\n') {
        redacted.push(String::new());
    }
    redacted.join("\n")
}

/// Redact sensitive `Config.Env` entries of a `docker inspect` document
pub fn redact_inspect(mut document: Value) -> Value {
    if let Some(env) = document
        .get_mut("Config")
        .and_then(|c| c.get_mut("Env"))
        .and_then(|e| e.as_array_mut())
    {
        for entry in env.iter_mut() {
            if let Some(raw) = entry.as_str() {
                if let Some((key, _)) = raw.split_once('=') {
                    if is_sensitive_key(key) {
                        *entry = Value::String(format!("{}={}", key, redaction::MARKER));
                    }
                }
            }
        }
    }
    document
}
