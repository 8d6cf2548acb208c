use super::{Config, UnitConfig};
use anyhow::{anyhow, Result};
use executor::backends::create_backend;
use executor::errors::{ConfigError, VaultError};
use glob::glob;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::constants::{parallelism, paths};

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    /// Load and validate `stackvault.toml` plus `units/*.toml` from `config_dir`
    pub async fn new(config_dir: &Path) -> Result<Self> {
        let config = Self::load_configuration(config_dir).await?;
        validate(&config)?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    /// Wrap an already-built configuration, still validated
    pub fn from_config(config: Config) -> Result<Self, VaultError> {
        validate(&config)?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &Path) -> Result<Config> {
        let main_config_path = config_dir.join(paths::MAIN_CONFIG_FILE);
        let main_config_content = fs::read_to_string(&main_config_path).await.map_err(|e| {
            VaultError::from(ConfigError::LoadFailed {
                path: main_config_path.display().to_string(),
                reason: e.to_string(),
            })
        })?;

        let mut config: Config = toml::from_str(&main_config_content).map_err(|e| {
            VaultError::from(ConfigError::ParseError {
                reason: format!("{}: {}", main_config_path.display(), e),
            })
        })?;

        let pattern = format!(
            "{}/{}/*.toml",
            config_dir.display(),
            paths::UNIT_CONFIG_DIR
        );
        let mut units = HashMap::new();

        for entry in glob(&pattern).map_err(|e| anyhow!("Glob pattern error: {}", e))? {
            let path = entry.map_err(|e| anyhow!("Glob entry error: {}", e))?;
            let unit_name = path
                .file_stem()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("Invalid unit config filename: {}", path.display()))?;

            debug!("Loading unit config: {}", path.display());

            let content = fs::read_to_string(&path).await.map_err(|e| {
                VaultError::from(ConfigError::LoadFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

            let unit_config: UnitConfig = toml::from_str(&content).map_err(|e| {
                VaultError::from(ConfigError::ParseError {
                    reason: format!("{}: {}", path.display(), e),
                })
            })?;

            units.insert(unit_name.to_string(), unit_config);
        }

        config.units = units;

        info!(
            "Loaded configuration with {} unit overrides, repository backend '{}'",
            config.units.len(),
            config.repository.backend.kind()
        );

        Ok(config)
    }
}

/// Reject configurations that would fail later in a pipeline
pub fn validate(config: &Config) -> Result<(), VaultError> {
    for (field, path) in [
        ("staging_root", &config.staging_root),
        ("scratch_root", &config.scratch_root),
    ] {
        if !path.is_absolute() {
            return Err(invalid(field, format!("'{}' must be absolute", path.display())));
        }
    }
    if config.staging_root == config.scratch_root {
        return Err(invalid(
            "scratch_root",
            "must differ from staging_root".to_string(),
        ));
    }

    if let Some(workers) = config.parallelism {
        if !(parallelism::MIN_WORKERS..=parallelism::MAX_CONFIGURED_WORKERS).contains(&workers) {
            return Err(invalid(
                "parallelism",
                format!(
                    "{} is outside {}..={}",
                    workers,
                    parallelism::MIN_WORKERS,
                    parallelism::MAX_CONFIGURED_WORKERS
                ),
            ));
        }
    }

    if config.helper_image.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "helper_image".to_string(),
        }
        .into());
    }

    if config.repository.password_file.as_os_str().is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "repository.password_file".to_string(),
        }
        .into());
    }
    create_backend(&config.repository.backend).validate_config()?;

    let t = &config.timeouts;
    for (field, value) in [
        ("timeouts.stop_seconds", t.stop_seconds),
        ("timeouts.start_seconds", t.start_seconds),
        ("timeouts.health_seconds", t.health_seconds),
        ("timeouts.snapshot_seconds", t.snapshot_seconds),
        ("timeouts.hook_seconds", t.hook_seconds),
        ("timeouts.command_seconds", t.command_seconds),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be greater than zero".to_string()));
        }
    }

    if let Some(url) = &config.notifications.webhook_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(
                "notifications.webhook_url",
                format!("'{}' is not an http(s) URL", url),
            ));
        }
    }
    if config.notifications.timeout_seconds == 0 {
        return Err(invalid(
            "notifications.timeout_seconds",
            "must be greater than zero".to_string(),
        ));
    }

    if config.dr_bundle.enabled && config.dr_bundle.path.is_none() {
        return Err(ConfigError::MissingRequired {
            field: "dr_bundle.path".to_string(),
        }
        .into());
    }

    Ok(())
}

fn invalid(field: &str, reason: String) -> VaultError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
    .into()
}
