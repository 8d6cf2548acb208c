//! Storage backend providers
//!
//! Each provider knows which binaries it needs, how to validate its own
//! settings, how to probe the target and which repository URL and
//! environment restic needs to reach it. The pipelines never see a concrete
//! backend; they only get the `ConnectionArgs` through `ResticCli`.

pub mod local;
pub mod mesh;
pub mod object_store;
pub mod rclone;
pub mod sftp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{ConfigError, PreconditionError, VaultError};
use crate::services::commands::CommandRunner;

pub use local::LocalBackend;
pub use mesh::MeshBackend;
pub use object_store::{ObjectStoreBackend, ObjectStoreProvider};
pub use rclone::RcloneBackend;
pub use sftp::SftpBackend;

/// What restic needs to open the repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub repository: String,
    pub env: Vec<(String, String)>,
    pub extra_args: Vec<String>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Required binaries are on PATH
    fn check_dependencies(&self) -> Result<(), VaultError>;

    fn validate_config(&self) -> Result<(), VaultError>;

    /// Probe the storage target without touching the repository
    async fn test_connection(&self, runner: &CommandRunner) -> Result<(), VaultError>;

    fn connection_args(&self) -> ConnectionArgs;
}

/// `[repository]` backend section, selected by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        path: PathBuf,
    },
    ObjectStore {
        provider: ObjectStoreProvider,
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        /// Credential variables passed to restic, e.g. AWS_ACCESS_KEY_ID
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Sftp {
        host: String,
        user: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        path: String,
        #[serde(default)]
        identity_file: Option<PathBuf>,
    },
    Mesh {
        /// Tailscale hostname or address of the peer running rest-server
        peer: String,
        #[serde(default = "default_rest_port")]
        port: u16,
        #[serde(default)]
        path: String,
        #[serde(default)]
        https: bool,
    },
    Rclone {
        remote: String,
        #[serde(default)]
        path: String,
    },
}

fn default_ssh_port() -> u16 {
    22
}

fn default_rest_port() -> u16 {
    8000
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Local { .. } => "local",
            BackendConfig::ObjectStore { .. } => "object_store",
            BackendConfig::Sftp { .. } => "sftp",
            BackendConfig::Mesh { .. } => "mesh",
            BackendConfig::Rclone { .. } => "rclone",
        }
    }
}

/// Build the provider for a configured backend
pub fn create_backend(config: &BackendConfig) -> Box<dyn StorageBackend> {
    match config {
        BackendConfig::Local { path } => Box::new(LocalBackend::new(path)),
        BackendConfig::ObjectStore {
            provider,
            bucket,
            prefix,
            endpoint,
            env,
        } => Box::new(ObjectStoreBackend::new(
            *provider,
            bucket,
            prefix.as_deref(),
            endpoint.as_deref(),
            env.clone(),
        )),
        BackendConfig::Sftp {
            host,
            user,
            port,
            path,
            identity_file,
        } => Box::new(SftpBackend::new(host, user, *port, path, identity_file.clone())),
        BackendConfig::Mesh {
            peer,
            port,
            path,
            https,
        } => Box::new(MeshBackend::new(peer, *port, path, *https)),
        BackendConfig::Rclone { remote, path } => Box::new(RcloneBackend::new(remote, path)),
    }
}

/// Locate an executable on PATH
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub(crate) fn require_binaries(tools: &[&str]) -> Result<(), VaultError> {
    for tool in tools {
        if find_binary(tool).is_none() {
            return Err(PreconditionError::MissingDependency {
                tool: tool.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

pub(crate) fn require_field(field: &str, value: &str) -> Result<(), VaultError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            field: format!("repository.{}", field),
        }
        .into());
    }
    Ok(())
}
