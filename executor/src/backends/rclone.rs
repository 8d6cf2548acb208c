use async_trait::async_trait;
use std::time::Duration;

use super::{require_binaries, require_field, ConnectionArgs, StorageBackend};
use crate::errors::VaultError;
use crate::services::commands::{CommandRunner, CommandSpec};

const RCLONE_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Any rclone remote, restic talks to it through `rclone serve restic`
pub struct RcloneBackend {
    remote: String,
    path: String,
}

impl RcloneBackend {
    pub fn new(remote: &str, path: &str) -> Self {
        Self {
            remote: remote.trim_end_matches(':').to_string(),
            path: path.trim_matches('/').to_string(),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.remote, self.path)
    }
}

#[async_trait]
impl StorageBackend for RcloneBackend {
    fn name(&self) -> &'static str {
        "rclone"
    }

    fn check_dependencies(&self) -> Result<(), VaultError> {
        require_binaries(&["restic", "rclone"])
    }

    fn validate_config(&self) -> Result<(), VaultError> {
        require_field("remote", &self.remote)
    }

    async fn test_connection(&self, runner: &CommandRunner) -> Result<(), VaultError> {
        let spec = CommandSpec::new("rclone")
            .args(["lsd", "--max-depth", "1"])
            .arg(format!("{}:", self.remote))
            .label("rclone lsd");
        runner.run_checked(&spec, Some(RCLONE_PROBE_TIMEOUT)).await?;
        Ok(())
    }

    fn connection_args(&self) -> ConnectionArgs {
        ConnectionArgs {
            repository: format!("rclone:{}", self.target()),
            ..Default::default()
        }
    }
}
