use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{require_binaries, require_field, ConnectionArgs, StorageBackend};
use crate::errors::{ConfigError, VaultError};
use crate::services::commands::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreProvider {
    S3,
    B2,
    Azure,
    Gcs,
}

impl ObjectStoreProvider {
    fn scheme(&self) -> &'static str {
        match self {
            ObjectStoreProvider::S3 => "s3",
            ObjectStoreProvider::B2 => "b2",
            ObjectStoreProvider::Azure => "azure",
            ObjectStoreProvider::Gcs => "gs",
        }
    }

    /// Credential variables restic reads for this provider
    fn credential_vars(&self) -> &'static [&'static str] {
        match self {
            ObjectStoreProvider::S3 => &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"],
            ObjectStoreProvider::B2 => &["B2_ACCOUNT_ID", "B2_ACCOUNT_KEY"],
            ObjectStoreProvider::Azure => &["AZURE_ACCOUNT_NAME", "AZURE_ACCOUNT_KEY"],
            ObjectStoreProvider::Gcs => &["GOOGLE_PROJECT_ID", "GOOGLE_APPLICATION_CREDENTIALS"],
        }
    }
}

/// S3, B2, Azure Blob or Google Cloud Storage bucket
pub struct ObjectStoreBackend {
    provider: ObjectStoreProvider,
    bucket: String,
    prefix: Option<String>,
    endpoint: Option<String>,
    env: BTreeMap<String, String>,
}

impl ObjectStoreBackend {
    pub fn new(
        provider: ObjectStoreProvider,
        bucket: &str,
        prefix: Option<&str>,
        endpoint: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            provider,
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_matches('/').to_string()),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            env,
        }
    }

    fn has_credential(&self, var: &str) -> bool {
        self.env.contains_key(var) || std::env::var_os(var).is_some()
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object_store"
    }

    fn check_dependencies(&self) -> Result<(), VaultError> {
        require_binaries(&["restic"])
    }

    fn validate_config(&self) -> Result<(), VaultError> {
        require_field("bucket", &self.bucket)?;
        if self.provider == ObjectStoreProvider::Azure && self.endpoint.is_some() {
            return Err(ConfigError::InvalidValue {
                field: "repository.endpoint".to_string(),
                reason: "azure repositories do not take a custom endpoint".to_string(),
            }
            .into());
        }
        for var in self.provider.credential_vars() {
            if !self.has_credential(var) {
                return Err(ConfigError::MissingRequired {
                    field: format!("repository.env.{}", var),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn test_connection(&self, _runner: &CommandRunner) -> Result<(), VaultError> {
        // Bucket reachability is only observable through restic itself
        self.validate_config()
    }

    fn connection_args(&self) -> ConnectionArgs {
        let location = match &self.prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", self.bucket, prefix),
            _ => self.bucket.clone(),
        };
        let repository = match (&self.provider, &self.endpoint) {
            (ObjectStoreProvider::S3, Some(endpoint)) => format!("s3:{}/{}", endpoint, location),
            (ObjectStoreProvider::S3, None) => {
                format!("s3:s3.amazonaws.com/{}", location)
            }
            (provider, _) => match &self.prefix {
                Some(prefix) if !prefix.is_empty() => {
                    format!("{}:{}:/{}", provider.scheme(), self.bucket, prefix)
                }
                _ => format!("{}:{}:/", provider.scheme(), self.bucket),
            },
        };
        ConnectionArgs {
            repository,
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn creds(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(ObjectStoreProvider::S3, None, "s3:s3.amazonaws.com/vault/hosts/a")]
    #[case(ObjectStoreProvider::S3, Some("https://minio.lan:9000"), "s3:https://minio.lan:9000/vault/hosts/a")]
    #[case(ObjectStoreProvider::B2, None, "b2:vault:/hosts/a")]
    #[case(ObjectStoreProvider::Gcs, None, "gs:vault:/hosts/a")]
    fn repository_url_per_provider(
        #[case] provider: ObjectStoreProvider,
        #[case] endpoint: Option<&str>,
        #[case] expected: &str,
    ) {
        let backend =
            ObjectStoreBackend::new(provider, "vault", Some("/hosts/a/"), endpoint, BTreeMap::new());
        assert_eq!(backend.connection_args().repository, expected);
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let backend = ObjectStoreBackend::new(
            ObjectStoreProvider::B2,
            "vault",
            None,
            None,
            creds(&[("B2_ACCOUNT_ID", "id")]),
        );
        let err = backend.validate_config().unwrap_err();
        assert!(err.to_string().contains("B2_ACCOUNT_KEY"));
    }

    #[test]
    fn credentials_are_passed_to_restic() {
        let backend = ObjectStoreBackend::new(
            ObjectStoreProvider::Azure,
            "vault",
            None,
            None,
            creds(&[("AZURE_ACCOUNT_NAME", "acct"), ("AZURE_ACCOUNT_KEY", "key")]),
        );
        backend.validate_config().unwrap();
        let args = backend.connection_args();
        assert_eq!(args.repository, "azure:vault:/");
        assert_eq!(args.env.len(), 2);
    }
}
