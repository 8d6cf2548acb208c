use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{require_binaries, require_field, ConnectionArgs, StorageBackend};
use crate::errors::{ConfigError, VaultError};
use crate::services::commands::{CommandRunner, CommandSpec};

const PEER_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// rest-server on a peer reached over the tailnet
pub struct MeshBackend {
    peer: String,
    port: u16,
    path: String,
    https: bool,
}

impl MeshBackend {
    pub fn new(peer: &str, port: u16, path: &str, https: bool) -> Self {
        Self {
            peer: peer.to_string(),
            port,
            path: path.trim_matches('/').to_string(),
            https,
        }
    }
}

#[async_trait]
impl StorageBackend for MeshBackend {
    fn name(&self) -> &'static str {
        "mesh"
    }

    fn check_dependencies(&self) -> Result<(), VaultError> {
        require_binaries(&["restic", "tailscale"])
    }

    fn validate_config(&self) -> Result<(), VaultError> {
        require_field("peer", &self.peer)?;
        if self.peer.contains("://") || self.peer.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "repository.peer".to_string(),
                reason: "expected a tailnet hostname or address, not a URL".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn test_connection(&self, runner: &CommandRunner) -> Result<(), VaultError> {
        debug!(peer = %self.peer, "Pinging mesh peer");
        let spec = CommandSpec::new("tailscale")
            .args(["ping", "-c", "1", self.peer.as_str()])
            .label("tailscale ping");
        runner.run_checked(&spec, Some(PEER_PING_TIMEOUT)).await?;
        Ok(())
    }

    fn connection_args(&self) -> ConnectionArgs {
        let scheme = if self.https { "https" } else { "http" };
        let repository = if self.path.is_empty() {
            format!("rest:{}://{}:{}/", scheme, self.peer, self.port)
        } else {
            format!("rest:{}://{}:{}/{}/", scheme, self.peer, self.port, self.path)
        };
        ConnectionArgs {
            repository,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_includes_path() {
        let backend = MeshBackend::new("vault-peer", 8000, "/hosts/web01/", true);
        assert_eq!(
            backend.connection_args().repository,
            "rest:https://vault-peer:8000/hosts/web01/"
        );
    }

    #[test]
    fn url_as_peer_is_rejected() {
        let backend = MeshBackend::new("http://vault-peer", 8000, "", false);
        assert!(backend.validate_config().is_err());
    }
}
