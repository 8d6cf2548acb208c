use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{require_binaries, ConnectionArgs, StorageBackend};
use crate::errors::{ConfigError, VaultError};
use crate::services::commands::CommandRunner;

/// Repository on a local or mounted filesystem
pub struct LocalBackend {
    path: PathBuf,
}

impl LocalBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn check_dependencies(&self) -> Result<(), VaultError> {
        require_binaries(&["restic"])
    }

    fn validate_config(&self) -> Result<(), VaultError> {
        if !self.path.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "repository.path".to_string(),
                reason: format!("'{}' must be an absolute path", self.path.display()),
            }
            .into());
        }
        Ok(())
    }

    async fn test_connection(&self, _runner: &CommandRunner) -> Result<(), VaultError> {
        debug!(path = %self.path.display(), "Checking local repository directory");
        tokio::fs::create_dir_all(&self.path).await?;
        let probe = self.path.join(".stackvault-write-test");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }

    fn connection_args(&self) -> ConnectionArgs {
        ConnectionArgs {
            repository: self.path.display().to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_safety::ExitSafety;
    use std::time::Duration;

    #[tokio::test]
    async fn writable_directory_passes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(&dir.path().join("repo"));
        let runner = CommandRunner::new(ExitSafety::new(), Duration::from_secs(5));

        backend.validate_config().unwrap();
        backend.test_connection(&runner).await.unwrap();
        assert!(dir.path().join("repo").is_dir());
    }

    #[test]
    fn relative_path_is_rejected() {
        let backend = LocalBackend::new(Path::new("backups/repo"));
        assert!(backend.validate_config().is_err());
    }
}
