use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::{require_binaries, require_field, ConnectionArgs, StorageBackend};
use crate::errors::VaultError;
use crate::services::commands::{CommandRunner, CommandSpec};

const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Repository on an SSH host
pub struct SftpBackend {
    host: String,
    user: String,
    port: u16,
    path: String,
    identity_file: Option<PathBuf>,
}

impl SftpBackend {
    pub fn new(
        host: &str,
        user: &str,
        port: u16,
        path: &str,
        identity_file: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            path: path.to_string(),
            identity_file,
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn name(&self) -> &'static str {
        "sftp"
    }

    fn check_dependencies(&self) -> Result<(), VaultError> {
        require_binaries(&["restic", "ssh"])
    }

    fn validate_config(&self) -> Result<(), VaultError> {
        require_field("host", &self.host)?;
        require_field("user", &self.user)?;
        require_field("path", &self.path)
    }

    async fn test_connection(&self, runner: &CommandRunner) -> Result<(), VaultError> {
        debug!(host = %self.host, "Probing SSH connectivity");
        let spec = CommandSpec::new("ssh")
            .args(self.ssh_options())
            .arg(format!("{}@{}", self.user, self.host))
            .arg("true")
            .label("ssh probe");
        runner.run_checked(&spec, Some(SSH_PROBE_TIMEOUT)).await?;
        Ok(())
    }

    fn connection_args(&self) -> ConnectionArgs {
        let mut extra_args = Vec::new();
        if self.port != 22 || self.identity_file.is_some() {
            // Custom port or key needs an explicit ssh command line
            let command = format!(
                "ssh {} {}@{} -s sftp",
                self.ssh_options().join(" "),
                self.user,
                self.host
            );
            extra_args.push("-o".to_string());
            extra_args.push(format!("sftp.command={}", command));
        }
        ConnectionArgs {
            repository: format!("sftp:{}@{}:{}", self.user, self.host, self.path),
            env: Vec::new(),
            extra_args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_port_adds_sftp_command() {
        let backend = SftpBackend::new("nas", "vault", 2222, "/srv/restic", None);
        let args = backend.connection_args();
        assert_eq!(args.repository, "sftp:vault@nas:/srv/restic");
        assert_eq!(
            args.extra_args,
            vec![
                "-o".to_string(),
                "sftp.command=ssh -o BatchMode=yes -p 2222 vault@nas -s sftp".to_string()
            ]
        );
    }

    #[test]
    fn default_port_needs_no_extra_args() {
        let backend = SftpBackend::new("nas", "vault", 22, "/srv/restic", None);
        assert!(backend.connection_args().extra_args.is_empty());
    }

    #[test]
    fn empty_host_fails_validation() {
        let backend = SftpBackend::new("", "vault", 22, "/srv/restic", None);
        assert!(backend.validate_config().is_err());
    }
}
