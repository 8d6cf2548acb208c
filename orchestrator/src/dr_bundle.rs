//! Disaster-recovery bundle: what a fresh host needs to find its backups
//!
//! The bundle names the repository (never its secrets), the source host and
//! the last backup of every unit. It is rewritten after each successful unit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrBundle {
    pub updated_at: Option<DateTime<Utc>>,
    pub hostname: String,
    pub repository_kind: String,
    pub repository: String,
    pub password_file: String,
    #[serde(default)]
    pub units: BTreeMap<String, DrUnitEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrUnitEntry {
    pub backup_id: String,
    pub backed_up_at: DateTime<Utc>,
    pub volumes: Vec<String>,
}

pub struct DrBundleUpdate<'a> {
    pub hostname: &'a str,
    pub repository_kind: &'a str,
    pub repository: &'a str,
    pub password_file: &'a Path,
    pub unit: &'a str,
    pub entry: DrUnitEntry,
}

/// Merge one unit's latest backup into the bundle at `path`
pub async fn update(path: &Path, update: DrBundleUpdate<'_>) -> Result<()> {
    let mut bundle = match fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str::<DrBundle>(&content)
            .with_context(|| format!("Unreadable DR bundle {}", path.display()))?,
        Err(_) => DrBundle::default(),
    };

    bundle.updated_at = Some(Utc::now());
    bundle.hostname = update.hostname.to_string();
    bundle.repository_kind = update.repository_kind.to_string();
    bundle.repository = strip_credentials(update.repository);
    bundle.password_file = update.password_file.display().to_string();
    bundle.units.insert(update.unit.to_string(), update.entry);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // Write then rename so a crash never leaves half a bundle
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&bundle)?).await?;
    fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), units = bundle.units.len(), "DR bundle updated");
    Ok(())
}

/// Drop `user:password@` from URL-style repository strings
fn strip_credentials(repository: &str) -> String {
    let Some(scheme_end) = repository.find("://") else {
        return repository.to_string();
    };
    let (scheme, rest) = repository.split_at(scheme_end + 3);
    match rest.split_once('@') {
        Some((userinfo, host)) if userinfo.contains(':') && !userinfo.contains('/') => {
            format!("{}{}", scheme, host)
        }
        _ => repository.to_string(),
    }
}
