pub mod manager;

use executor::backends::BackendConfig;
use executor::types::{HookSet, RetentionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::constants::{notifications, parallelism, paths, timeouts};
use crate::restore::networks::ConflictPolicy;

pub use manager::ConfigManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host name recorded on snapshots; defaults to the system host name
    pub hostname: Option<String>,
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    /// Volume snapshot workers; computed from CPU and memory when unset
    pub parallelism: Option<usize>,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default)]
    pub non_interactive: bool,
    #[serde(default)]
    pub exclude_units: Vec<String>,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub dr_bundle: DrBundleConfig,
    // Populated from units/*.toml
    #[serde(skip)]
    pub units: HashMap<String, UnitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub password_file: PathBuf,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_stop_seconds")]
    pub stop_seconds: u64,
    #[serde(default = "default_start_seconds")]
    pub start_seconds: u64,
    #[serde(default = "default_health_seconds")]
    pub health_seconds: u64,
    #[serde(default = "default_snapshot_seconds")]
    pub snapshot_seconds: u64,
    #[serde(default = "default_hook_seconds")]
    pub hook_seconds: u64,
    #[serde(default = "default_command_seconds")]
    pub command_seconds: u64,
}

impl TimeoutConfig {
    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_seconds)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_seconds)
    }

    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_seconds)
    }

    pub fn snapshot(&self) -> Duration {
        Duration::from_secs(self.snapshot_seconds)
    }

    pub fn hook(&self) -> Duration {
        Duration::from_secs(self.hook_seconds)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_seconds)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stop_seconds: default_stop_seconds(),
            start_seconds: default_start_seconds(),
            health_seconds: default_health_seconds(),
            snapshot_seconds: default_snapshot_seconds(),
            hook_seconds: default_hook_seconds(),
            command_seconds: default_command_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub notify_on_success: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_seconds: default_webhook_timeout(),
            notify_on_success: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrBundleConfig {
    #[serde(default)]
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

/// Per-unit settings from `units/<unit>.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitConfig {
    #[serde(default)]
    pub hooks: HookSet,
    /// restic exclude patterns for this unit's volumes
    #[serde(default)]
    pub excludes: Vec<String>,
    pub stop_timeout_seconds: Option<u64>,
    /// Volumes of this unit that are never backed up
    #[serde(default)]
    pub skip_volumes: Vec<String>,
}

fn default_staging_root() -> PathBuf {
    PathBuf::from(paths::DEFAULT_STAGING_ROOT)
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from(paths::DEFAULT_SCRATCH_ROOT)
}

fn default_helper_image() -> String {
    paths::DEFAULT_HELPER_IMAGE.to_string()
}

fn default_stop_seconds() -> u64 {
    timeouts::STOP_SECONDS
}

fn default_start_seconds() -> u64 {
    timeouts::START_SECONDS
}

fn default_health_seconds() -> u64 {
    timeouts::HEALTH_SECONDS
}

fn default_snapshot_seconds() -> u64 {
    timeouts::SNAPSHOT_SECONDS
}

fn default_hook_seconds() -> u64 {
    timeouts::HOOK_SECONDS
}

fn default_command_seconds() -> u64 {
    timeouts::COMMAND_SECONDS
}

fn default_webhook_timeout() -> u64 {
    notifications::WEBHOOK_TIMEOUT_SECONDS
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn unit(&self, name: &str) -> UnitConfig {
        self.units.get(name).cloned().unwrap_or_default()
    }

    pub fn is_excluded(&self, unit: &str) -> bool {
        self.exclude_units.iter().any(|u| u == unit)
    }

    pub fn stop_timeout_for(&self, unit: &str) -> Duration {
        self.units
            .get(unit)
            .and_then(|u| u.stop_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.timeouts.stop())
    }

    pub fn effective_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Configured worker count, or one derived from CPU and free memory
    pub fn effective_parallelism(&self) -> usize {
        if let Some(configured) = self.parallelism {
            return configured.clamp(parallelism::MIN_WORKERS, parallelism::MAX_CONFIGURED_WORKERS);
        }

        let mut system = sysinfo::System::new();
        system.refresh_cpu();
        system.refresh_memory();
        let cpus = system.cpus().len().max(1);
        let available_gib = system.available_memory() / (1024 * 1024 * 1024);
        let workers = default_parallelism(cpus, available_gib);
        debug!(cpus, available_gib, workers, "Computed volume worker count");
        workers
    }
}

/// `min(cpus / 2, available_gib / 2)` clamped to the default worker range
pub fn default_parallelism(cpus: usize, available_gib: u64) -> usize {
    let by_cpu = cpus / 2;
    let by_memory = usize::try_from(available_gib / parallelism::GIB_PER_WORKER).unwrap_or(usize::MAX);
    by_cpu
        .min(by_memory)
        .clamp(parallelism::MIN_WORKERS, parallelism::MAX_DEFAULT_WORKERS)
}
